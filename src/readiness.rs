//! One-shot readiness latch fed by server output lines.

use std::time::Duration;

use tokio::sync::watch;

/// Marker redis-server prints once it accepts connections.
///
/// Newer builds print "Ready to accept connections tcp", older ones
/// "The server is now ready to accept connections on port N"; matching is
/// case-insensitive so both hit.
pub const DEFAULT_READY_MARKER: &str = "Ready to accept connections";

/// Watches output lines for the ready marker.
///
/// Two states, `Waiting` and `Ready`, with a single forward transition on
/// the first matching line. Later lines never change the state.
#[derive(Debug)]
pub struct ReadinessDetector {
    marker: String,
    ready: watch::Sender<bool>,
}

impl ReadinessDetector {
    /// Create a detector for `marker`. An empty marker never matches.
    ///
    /// Matching is a case-insensitive substring test, so the current and
    /// the legacy redis-server banners both count as ready.
    pub fn new(marker: impl Into<String>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            marker: marker.into().to_lowercase(),
            ready,
        }
    }

    /// Feed one line. Returns true only for the line that flipped the latch.
    pub fn observe(&self, line: &str) -> bool {
        if self.marker.is_empty() || line.trim().is_empty() {
            return false;
        }
        if !line.to_lowercase().contains(&self.marker) {
            return false;
        }

        self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// Whether the marker has been seen.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the marker was seen. False on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }
}

impl Default for ReadinessDetector {
    fn default() -> Self {
        Self::new(DEFAULT_READY_MARKER)
    }
}
