// Application configuration.
// The default log filter depends on the build profile; RUST_LOG overrides it.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{CallError, CallResult};
use crate::peer::state::GRACE_PERIOD;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "mockcall=debug,webrtc=warn"; // debug builds are verbose

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "mockcall=info,webrtc=error";

/// Public STUN servers appended after the fetched TURN entries.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const ENV_PREFIX: &str = "MOCKCALL_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Backend serving `/turn-credentials`, `/direct-token` and `/interviews`.
    pub api_base_url: String,
    /// Realtime inference endpoint receiving the SDP offer.
    pub realtime_url: String,
    pub realtime_model: String,
    /// Bearer token of the signed-in user, if any.
    pub access_token: Option<String>,
    pub token_ttl_secs: u64,
    pub ice_gather_timeout_ms: u64,
    pub stun_servers: Vec<String>,
    pub trial_ceiling_secs: u64,
    pub disconnect_grace_secs: u64,
    /// Delays of the autoplay retries that follow the immediate attempt.
    pub playback_retry_delays_ms: Vec<u64>,
    pub heartbeat_interval_secs: u64,
    pub visualizer_frame_ms: u64,
    pub notification_ttl_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            realtime_url: "https://api.openai.com/v1/realtime".to_string(),
            realtime_model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
            access_token: None,
            token_ttl_secs: 300,
            ice_gather_timeout_ms: 5_000,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            trial_ceiling_secs: 60,
            disconnect_grace_secs: GRACE_PERIOD.as_secs(),
            playback_retry_delays_ms: vec![250, 1_000, 2_000],
            heartbeat_interval_secs: 15,
            visualizer_frame_ms: 16,
            notification_ttl_ms: 5_000,
            request_timeout_secs: 15,
        }
    }
}

impl CallConfig {
    /// Defaults overridden by `MOCKCALL_*` variables. Callers load any `.env` file beforehand.
    pub fn from_env() -> CallResult<Self> {
        let mut config = Self::default();
        if let Some(v) = env_string("API_BASE_URL") {
            config.api_base_url = v;
        }
        if let Some(v) = env_string("REALTIME_URL") {
            config.realtime_url = v;
        }
        if let Some(v) = env_string("REALTIME_MODEL") {
            config.realtime_model = v;
        }
        config.access_token = env_string("ACCESS_TOKEN");
        if let Some(list) = env_string("STUN_SERVERS") {
            config.stun_servers = split_list(&list);
        }
        if let Some(list) = env_string("PLAYBACK_RETRY_DELAYS_MS") {
            config.playback_retry_delays_ms = split_list(&list)
                .iter()
                .map(|v| parse_value("PLAYBACK_RETRY_DELAYS_MS", v))
                .collect::<CallResult<_>>()?;
        }
        env_parse("TOKEN_TTL_SECS", &mut config.token_ttl_secs)?;
        env_parse("ICE_GATHER_TIMEOUT_MS", &mut config.ice_gather_timeout_ms)?;
        env_parse("TRIAL_CEILING_SECS", &mut config.trial_ceiling_secs)?;
        env_parse("DISCONNECT_GRACE_SECS", &mut config.disconnect_grace_secs)?;
        env_parse("HEARTBEAT_INTERVAL_SECS", &mut config.heartbeat_interval_secs)?;
        env_parse("VISUALIZER_FRAME_MS", &mut config.visualizer_frame_ms)?;
        env_parse("NOTIFICATION_TTL_MS", &mut config.notification_ttl_ms)?;
        env_parse("REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CallResult<()> {
        for (name, value) in [
            ("api_base_url", &self.api_base_url),
            ("realtime_url", &self.realtime_url),
        ] {
            let url = Url::parse(value)
                .map_err(|e| CallError::Config(format!("{name} '{value}' is not a URL: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(CallError::Config(format!("{name} must be http(s), got '{value}'")));
            }
        }
        if self.realtime_model.trim().is_empty() {
            return Err(CallError::Config("realtime_model is empty".into()));
        }
        for (name, value) in [
            ("token_ttl_secs", self.token_ttl_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("visualizer_frame_ms", self.visualizer_frame_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(CallError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }

    pub fn trial_ceiling(&self) -> Duration {
        Duration::from_secs(self.trial_ceiling_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn playback_retry_delays(&self) -> Vec<Duration> {
        self.playback_retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn visualizer_frame(&self) -> Duration {
        Duration::from_millis(self.visualizer_frame_ms)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, slot: &mut T) -> CallResult<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env_string(name) {
        *slot = parse_value(name, &raw)?;
    }
    Ok(())
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> CallResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| CallError::Config(format!("{ENV_PREFIX}{name}='{raw}': {e}")))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CallConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ice_gather_timeout(), Duration::from_secs(5));
        assert_eq!(config.trial_ceiling(), Duration::from_secs(60));
        assert_eq!(config.disconnect_grace(), GRACE_PERIOD);
        assert_eq!(config.stun_servers.len(), 2);
    }

    #[test]
    fn rejects_bad_urls_and_zero_intervals() {
        let config = CallConfig {
            api_base_url: "not a url".into(),
            ..CallConfig::default()
        };
        assert!(matches!(config.validate(), Err(CallError::Config(_))));

        let config = CallConfig {
            realtime_url: "ftp://example.org/realtime".into(),
            ..CallConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CallConfig {
            visualizer_frame_ms: 0,
            ..CallConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: CallConfig =
            serde_json::from_str(r#"{"trial_ceiling_secs": 30, "stun_servers": []}"#).unwrap();
        assert_eq!(config.trial_ceiling_secs, 30);
        assert!(config.stun_servers.is_empty());
        assert_eq!(config.token_ttl_secs, 300);
    }

    #[test]
    fn list_values_are_trimmed() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
    }
}
