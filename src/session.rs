use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CallError, CallResult};
use crate::peer::state::ConnectionState;

/// Identifier of the interview case or demo a call is for.
///
/// Routes used to pass this either as a session id or a demo type id; both name the same
/// thing and both end up here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallTargetId(String);

impl CallTargetId {
    pub fn new(raw: impl Into<String>) -> CallResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CallError::Config("call target id is empty".into()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CallError::Config(format!(
                "call target id '{trimmed}' contains whitespace"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CallTargetId {
    type Error = CallError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CallTargetId> for String {
    fn from(id: CallTargetId) -> Self {
        id.0
    }
}

impl fmt::Display for CallTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    pub id: CallTargetId,
    pub question_number: u32,
    pub title: Option<String>,
}

impl CallTarget {
    pub fn new(id: CallTargetId) -> Self {
        Self {
            id,
            question_number: 1,
            title: None,
        }
    }

    pub fn with_question(mut self, question_number: Option<u32>) -> Self {
        self.question_number = question_number.unwrap_or(1);
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }
}

/// What the viewer is entitled to; decides the trial ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Anonymous,
    Free,
    Paid,
}

impl Access {
    pub fn is_authenticated(self) -> bool {
        !matches!(self, Access::Anonymous)
    }

    pub fn has_paid_access(self) -> bool {
        matches!(self, Access::Paid)
    }
}

/// Point-in-time view of a call, for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub target_id: CallTargetId,
    pub question_number: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub connection_state: ConnectionState,
    pub muted: bool,
    pub call_active: bool,
}
