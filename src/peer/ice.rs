use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::peer::types::IceServer;
use crate::utils::normalize_ice_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringOutcome {
    Complete,
    TimedOut,
}

/// Fetched servers first, then the static STUN fallbacks that are not already listed.
pub fn combined_ice_servers(fetched: Vec<IceServer>, stun_fallbacks: &[String]) -> Vec<IceServer> {
    let mut servers = fetched;
    let known: Vec<String> = servers.iter().flat_map(|s| s.urls.to_vec()).collect();
    for url in stun_fallbacks {
        let url = normalize_ice_url(url, false);
        if !known.contains(&url) {
            servers.push(IceServer::stun(url));
        }
    }
    servers
}

pub fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| {
            let has_credentials = server.has_credentials();
            RTCIceServer {
                urls: server
                    .urls
                    .to_vec()
                    .iter()
                    .map(|url| normalize_ice_url(url, has_credentials))
                    .collect(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            }
        })
        .collect()
}

/// Waits for gathering to finish, but never longer than `limit`; slow candidate
/// discovery then goes out with whatever was gathered so far.
pub async fn wait_for_gathering<F>(gathering: F, limit: Duration) -> GatheringOutcome
where
    F: Future<Output = ()>,
{
    match timeout(limit, gathering).await {
        Ok(()) => {
            debug!("ICE gathering complete");
            GatheringOutcome::Complete
        }
        Err(_) => {
            info!(limit_ms = limit.as_millis() as u64, "ICE gathering timed out, sending partial offer");
            GatheringOutcome::TimedOut
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateCounts {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl CandidateCounts {
    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay
    }
}

/// Counts candidate types in an SDP and warns when nothing can relay through NAT.
pub fn analyze_candidates(sdp: &str) -> CandidateCounts {
    let mut counts = CandidateCounts::default();
    for line in sdp.lines().filter(|l| l.starts_with("a=candidate:")) {
        if line.contains("typ host") {
            counts.host += 1;
        } else if line.contains("typ srflx") {
            counts.srflx += 1;
        } else if line.contains("typ relay") {
            counts.relay += 1;
        }
    }

    info!(
        host = counts.host,
        srflx = counts.srflx,
        relay = counts.relay,
        "candidate analysis"
    );
    if counts.relay == 0 {
        warn!("no TURN relay candidates; connection through strict NAT may fail");
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::IceUrls;

    fn turn() -> IceServer {
        IceServer {
            urls: IceUrls::Many(vec![
                "turn:relay.example.org:3478".into(),
                "stun:stun.l.google.com:19302".into(),
            ]),
            username: Some("user".into()),
            credential: Some("secret".into()),
        }
    }

    #[test]
    fn fallbacks_follow_fetched_servers_without_duplicates() {
        let fallbacks = vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun1.l.google.com:19302".to_string(),
        ];
        let servers = combined_ice_servers(vec![turn()], &fallbacks);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0], turn());
        assert_eq!(servers[1].urls.to_vec(), vec!["stun:stun1.l.google.com:19302"]);
    }

    #[test]
    fn fallbacks_alone_when_nothing_fetched() {
        let fallbacks = vec!["stun:stun.l.google.com:19302".to_string()];
        let servers = combined_ice_servers(Vec::new(), &fallbacks);
        assert_eq!(servers.len(), 1);
        assert!(!servers[0].has_credentials());
    }

    #[test]
    fn rtc_servers_keep_credentials() {
        let rtc = to_rtc_ice_servers(&[turn()]);
        assert_eq!(rtc.len(), 1);
        assert_eq!(rtc[0].urls.len(), 2);
        assert_eq!(rtc[0].username, "user");
        assert_eq!(rtc[0].credential, "secret");
    }

    #[tokio::test(start_paused = true)]
    async fn gathering_wait_is_bounded() {
        let outcome = wait_for_gathering(std::future::pending(), Duration::from_secs(5)).await;
        assert_eq!(outcome, GatheringOutcome::TimedOut);

        let outcome = wait_for_gathering(async {}, Duration::from_secs(5)).await;
        assert_eq!(outcome, GatheringOutcome::Complete);
    }

    #[test]
    fn counts_candidate_types() {
        let sdp = "v=0\r\n\
            a=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n\
            a=candidate:2 1 udp 1694498815 203.0.113.5 50001 typ srflx raddr 192.168.1.2 rport 50000\r\n\
            a=candidate:3 1 udp 16777215 198.51.100.7 3478 typ relay raddr 203.0.113.5 rport 50001\r\n\
            a=candidate:4 1 udp 2130706431 10.0.0.2 50002 typ host\r\n";
        let counts = analyze_candidates(sdp);
        assert_eq!(
            counts,
            CandidateCounts {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
        assert_eq!(counts.total(), 4);
        assert_eq!(analyze_candidates("v=0\r\n").total(), 0);
    }
}
