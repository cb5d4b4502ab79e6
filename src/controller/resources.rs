use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::timer::CallClock;
use crate::media::playback::RemoteAudioStream;
use crate::media::LocalMedia;
use crate::peer::PeerLink;

/// Everything a call holds that must be released when it ends.
#[derive(Default)]
pub struct CallResources {
    pub media: Option<Arc<LocalMedia>>,
    pub peer: Option<Arc<dyn PeerLink>>,
    pub clock: Option<CallClock>,
    pub remote_audio: Option<Arc<RemoteAudioStream>>,
    pub pending_unlock: Option<Arc<RemoteAudioStream>>,
    pub grace: Option<CancellationToken>,
}

impl CallResources {
    /// Empties the holder. Whoever gets the result owns the release, so two teardowns never
    /// release the same thing twice.
    pub fn take_all(&mut self) -> Released {
        let taken = std::mem::take(self);
        Released {
            media: taken.media,
            peer: taken.peer,
            grace: taken.grace,
            had_remote_audio: taken.remote_audio.is_some() || taken.pending_unlock.is_some(),
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.media.is_none() && self.peer.is_none() && self.clock.is_none()
    }
}

#[must_use = "taken resources are only released by `release`"]
pub struct Released {
    media: Option<Arc<LocalMedia>>,
    peer: Option<Arc<dyn PeerLink>>,
    grace: Option<CancellationToken>,
    had_remote_audio: bool,
}

impl Released {
    /// Synchronous half of the release: tracks stop and timers are cancelled right away.
    pub fn stop_local(&mut self) {
        if let Some(grace) = self.grace.take() {
            grace.cancel();
        }
        if let Some(media) = self.media.take() {
            media.stop_all();
        }
    }

    pub async fn release(mut self) {
        self.stop_local();
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!(error = %e, "closing peer during teardown");
            }
        }
        debug!(remote_audio = self.had_remote_audio, "call resources released");
    }

    /// Release for synchronous callers: local capture stops now and the peer is closed on
    /// the current runtime, if there is one.
    pub fn release_detached(mut self, reason: &'static str) {
        self.stop_local();
        let Some(peer) = self.peer.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = peer.close().await {
                        warn!(error = %e, reason, "closing peer");
                    }
                });
            }
            Err(_) => warn!(reason, "no runtime to close the peer on; left to its own drop"),
        }
    }
}
