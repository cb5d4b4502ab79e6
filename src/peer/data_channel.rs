use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

pub const HEARTBEAT_LABEL: &str = "heartbeat";

pub fn heartbeat_payload(seq: u64) -> String {
    json!({ "type": "heartbeat", "seq": seq }).to_string()
}

/// Opens the heartbeat channel. Best effort: a failure is logged and the call goes on
/// without it.
pub async fn open_heartbeat(
    pc: &RTCPeerConnection,
    every: Duration,
    shutdown: CancellationToken,
) -> Option<Arc<RTCDataChannel>> {
    match pc
        .create_data_channel(HEARTBEAT_LABEL, Some(RTCDataChannelInit::default()))
        .await
    {
        Ok(dc) => {
            attach_heartbeat(&dc, every, shutdown);
            Some(dc)
        }
        Err(e) => {
            warn!(error = %e, "heartbeat channel unavailable");
            None
        }
    }
}

fn attach_heartbeat(dc: &Arc<RTCDataChannel>, every: Duration, shutdown: CancellationToken) {
    dc.on_open(Box::new({
        let dc = Arc::clone(dc);
        move || {
            debug!("heartbeat channel open");
            tokio::spawn(heartbeat_loop(dc, every, shutdown));
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new(|msg| {
        trace!(len = msg.data.len(), "data channel message");
        Box::pin(async {})
    }));

    dc.on_close(Box::new(|| {
        debug!("heartbeat channel closed");
        Box::pin(async {})
    }));
}

async fn heartbeat_loop(dc: Arc<RTCDataChannel>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                seq += 1;
                if let Err(e) = dc.send_text(heartbeat_payload(seq)).await {
                    debug!(error = %e, seq, "heartbeat stopped");
                    break;
                }
            }
        }
    }
}
