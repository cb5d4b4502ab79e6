use std::fmt;

use thiserror::Error;

use crate::peer::state::ConnectionState;

/// Signaling round-trip a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingStep {
    TurnCredentials,
    SessionToken,
    SdpExchange,
    CompleteQuestion,
}

impl fmt::Display for SignalingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingStep::TurnCredentials => "TURN credential request",
            SignalingStep::SessionToken => "session token request",
            SignalingStep::SdpExchange => "SDP exchange",
            SignalingStep::CompleteQuestion => "complete-question request",
        };
        f.write_str(name)
    }
}

/// Coarse classes used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Media devices denied or missing. Terminal for the attempt.
    Permission,
    /// TURN/token/SDP round-trip failed.
    Signaling,
    /// ICE/SDP negotiation failed inside the peer connection.
    Negotiation,
    /// Misuse or local setup problems.
    Internal,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access denied: {0}")]
    PermissionDenied(String),

    #[error("media device unavailable: {0}")]
    MediaUnavailable(String),

    #[error("{step} failed with status {status}: {message}")]
    Http {
        step: SignalingStep,
        status: u16,
        message: String,
    },

    #[error("{step} could not be sent: {source}")]
    Transport {
        step: SignalingStep,
        #[source]
        source: reqwest::Error,
    },

    #[error("{step} returned an invalid response: {message}")]
    InvalidResponse {
        step: SignalingStep,
        message: String,
    },

    #[error("peer negotiation failed: {0}")]
    Negotiation(String),

    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    #[error("call session is {0} and cannot connect")]
    SessionUnavailable(ConnectionState),

    #[error("call was torn down while connecting")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type CallResult<T> = Result<T, CallError>;

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::PermissionDenied(_) | CallError::MediaUnavailable(_) => ErrorKind::Permission,
            CallError::Http { .. } | CallError::Transport { .. } | CallError::InvalidResponse { .. } => {
                ErrorKind::Signaling
            }
            CallError::Negotiation(_) => ErrorKind::Negotiation,
            CallError::ConnectInProgress
            | CallError::SessionUnavailable(_)
            | CallError::Cancelled
            | CallError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Text shown to the user in an error notification.
    pub fn user_message(&self) -> String {
        match self {
            CallError::PermissionDenied(_) => {
                "Microphone or camera access was denied. Allow access in your browser or system settings and try again.".to_string()
            }
            CallError::MediaUnavailable(detail) => {
                format!("No usable microphone or camera was found ({detail}).")
            }
            CallError::Http {
                step,
                status,
                message,
            } => format!("Could not start the interview: {step} failed (HTTP {status}: {message})."),
            CallError::Transport { step, source } if source.is_timeout() => {
                format!("Could not start the interview: {step} timed out.")
            }
            CallError::Transport { step, .. } => {
                format!("Could not start the interview: {step} could not reach the server.")
            }
            CallError::InvalidResponse { step, .. } => {
                format!("Could not start the interview: {step} returned an unexpected response.")
            }
            CallError::Negotiation(_) => {
                "The call connection could not be established. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        CallError::Negotiation(err.to_string())
    }
}
