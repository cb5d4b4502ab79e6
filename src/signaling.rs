//! HTTPS signaling round-trip: TURN credentials, ephemeral token, SDP exchange and the
//! best-effort "question complete" notification.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use zeroize::Zeroizing;

use crate::config::CallConfig;
use crate::error::{CallError, CallResult, SignalingStep};
use crate::peer::types::{IceServer, TurnCredentials};
use crate::session::CallTarget;

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Short-lived credential for the realtime endpoint, wiped from memory on drop.
#[derive(Clone)]
pub struct SessionToken(Zeroizing<String>);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(***)")
    }
}

#[async_trait]
pub trait Signaling: Send + Sync {
    async fn turn_credentials(&self) -> CallResult<Vec<IceServer>>;

    async fn session_token(&self, target: &CallTarget, ttl: Duration) -> CallResult<SessionToken>;

    /// Sends the local SDP offer and returns the remote SDP answer.
    async fn exchange_sdp(&self, token: &SessionToken, offer_sdp: &str) -> CallResult<String>;

    async fn complete_question(&self, target: &CallTarget) -> CallResult<()>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Serialize)]
struct CompleteQuestion<'a> {
    case_type: &'a str,
    question_number: u32,
}

pub struct HttpSignaling {
    client: Client,
    api_base: Url,
    realtime_url: Url,
    model: String,
    access_token: Option<Zeroizing<String>>,
}

impl HttpSignaling {
    pub fn new(config: &CallConfig) -> CallResult<Self> {
        config.validate()?;
        let api_base = Url::parse(&config.api_base_url)
            .map_err(|e| CallError::Config(format!("api_base_url: {e}")))?;
        let realtime_url = Url::parse(&config.realtime_url)
            .map_err(|e| CallError::Config(format!("realtime_url: {e}")))?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CallError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            api_base,
            realtime_url,
            model: config.realtime_model.clone(),
            access_token: config.access_token.clone().map(Zeroizing::new),
        })
    }

    /// `api_base` joined with `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> CallResult<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| CallError::Config(format!("api_base_url '{}' cannot be a base", self.api_base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token.as_str()),
            None => request,
        }
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn turn_credentials(&self) -> CallResult<Vec<IceServer>> {
        let step = SignalingStep::TurnCredentials;
        let url = self.endpoint(&["turn-credentials"])?;
        debug!(%url, "fetching TURN credentials");

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|source| CallError::Transport { step, source })?;
        let creds: TurnCredentials = ensure_success(step, response)
            .await?
            .json()
            .await
            .map_err(|e| invalid(step, e))?;

        info!(servers = creds.ice_servers.len(), "TURN credentials received");
        Ok(creds.ice_servers)
    }

    async fn session_token(&self, target: &CallTarget, ttl: Duration) -> CallResult<SessionToken> {
        let step = SignalingStep::SessionToken;
        let question = target.question_number.to_string();
        let url = self.endpoint(&["direct-token", target.id.as_str(), &question])?;
        debug!(%url, ttl_secs = ttl.as_secs(), "fetching session token");

        let response = self
            .authorize(self.client.get(url))
            .query(&[("ttl", ttl.as_secs())])
            .send()
            .await
            .map_err(|source| CallError::Transport { step, source })?;
        let body: TokenResponse = ensure_success(step, response)
            .await?
            .json()
            .await
            .map_err(|e| invalid(step, e))?;

        let token = Zeroizing::new(body.token);
        if token.trim().is_empty() {
            return Err(invalid(step, "token is empty"));
        }
        Ok(SessionToken(token))
    }

    async fn exchange_sdp(&self, token: &SessionToken, offer_sdp: &str) -> CallResult<String> {
        let step = SignalingStep::SdpExchange;
        debug!(url = %self.realtime_url, model = %self.model, offer_len = offer_sdp.len(), "posting SDP offer");

        let response = self
            .client
            .post(self.realtime_url.clone())
            .query(&[("model", self.model.as_str())])
            .bearer_auth(token.expose())
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .header(ACCEPT, SDP_CONTENT_TYPE)
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|source| CallError::Transport { step, source })?;
        let answer = ensure_success(step, response)
            .await?
            .text()
            .await
            .map_err(|source| CallError::Transport { step, source })?;

        if !answer.trim_start().starts_with("v=") {
            return Err(invalid(step, "answer is not an SDP document"));
        }
        info!(answer_len = answer.len(), "SDP answer received");
        Ok(answer)
    }

    async fn complete_question(&self, target: &CallTarget) -> CallResult<()> {
        let step = SignalingStep::CompleteQuestion;
        let url = self.endpoint(&["interviews", "complete-question"])?;
        let body = CompleteQuestion {
            case_type: target.id.as_str(),
            question_number: target.question_number,
        };

        let response = self
            .authorize(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|source| CallError::Transport { step, source })?;
        ensure_success(step, response).await?;
        Ok(())
    }
}

async fn ensure_success(step: SignalingStep, response: Response) -> CallResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CallError::Http {
        step,
        status: status.as_u16(),
        message: error_message(&body, status),
    })
}

fn invalid(step: SignalingStep, err: impl fmt::Display) -> CallError {
    CallError::InvalidResponse {
        step,
        message: err.to_string(),
    }
}

/// Best human-readable message from an error body.
fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let candidates = [
            json.pointer("/error/message"),
            json.get("error"),
            json.get("message"),
            json.get("detail"),
        ];
        for value in candidates.into_iter().flatten() {
            if let Some(text) = value.as_str().map(str::trim).filter(|t| !t.is_empty()) {
                return text.to_string();
            }
        }
    }

    let text = body.trim();
    if !text.is_empty() && text.len() <= 200 && !text.starts_with('{') && !text.starts_with('<') {
        return text.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_from_nested_error() {
        let body = r#"{"error":{"message":"Invalid ephemeral key","type":"invalid_request_error"}}"#;
        assert_eq!(error_message(body, StatusCode::UNAUTHORIZED), "Invalid ephemeral key");
    }

    #[test]
    fn message_from_flat_fields() {
        assert_eq!(error_message(r#"{"error":"quota"}"#, StatusCode::FORBIDDEN), "quota");
        assert_eq!(error_message(r#"{"detail":"Not found"}"#, StatusCode::NOT_FOUND), "Not found");
        assert_eq!(error_message(r#"{"message":"later"}"#, StatusCode::SERVICE_UNAVAILABLE), "later");
    }

    #[test]
    fn message_falls_back_to_text_then_reason() {
        assert_eq!(error_message("upstream down", StatusCode::BAD_GATEWAY), "upstream down");
        assert_eq!(
            error_message("<html>oops</html>", StatusCode::INTERNAL_SERVER_ERROR),
            "Internal Server Error"
        );
        assert_eq!(error_message("", StatusCode::INTERNAL_SERVER_ERROR), "Internal Server Error");
        assert_eq!(error_message(r#"{"code":7}"#, StatusCode::BAD_REQUEST), "Bad Request");
    }

    #[test]
    fn endpoint_encodes_segments() {
        let config = CallConfig {
            api_base_url: "https://api.example.org/v2/".into(),
            ..CallConfig::default()
        };
        let signaling = HttpSignaling::new(&config).unwrap();
        let url = signaling.endpoint(&["direct-token", "a/b", "2"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.org/v2/direct-token/a%2Fb/2");
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = SessionToken::new("ek_secret");
        assert_eq!(format!("{token:?}"), "SessionToken(***)");
        assert_eq!(token.expose(), "ek_secret");
    }
}
