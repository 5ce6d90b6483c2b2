//! Live call session
//!
//! Owns the two real-time connections for one call: the carrier media
//! stream on one side and the voice-agent session on the other. Three
//! relay loops run per call (inbound audio, heartbeat, voice events),
//! connected by explicit channels; a language switch is a controlled
//! pause-and-reconnect of the voice side.

mod coordinator;
pub mod telephony;
pub mod voice;

#[cfg(test)]
pub mod testing;

pub use coordinator::{CallSession, CallSettings, SessionDeps};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Lifecycle of one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Streaming,
    /// Transient: voice side torn down and reopened for a language switch.
    LanguageReconnect,
    Terminating,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub call_id: String,
    pub started_at: DateTime<Utc>,
}

/// In-memory registry of streams currently bridged, keyed by stream id.
/// Owned by the process entry point and passed by reference; there are no
/// ambient globals.
#[derive(Default)]
pub struct CallRegistry {
    active: Mutex<HashMap<String, ActiveCall>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stream_id: &str, call_id: &str) {
        self.active.lock().expect("registry lock").insert(
            stream_id.to_string(),
            ActiveCall {
                call_id: call_id.to_string(),
                started_at: Utc::now(),
            },
        );
    }

    pub fn remove(&self, stream_id: &str) -> Option<ActiveCall> {
        self.active.lock().expect("registry lock").remove(stream_id)
    }

    pub fn call_for_stream(&self, stream_id: &str) -> Option<String> {
        self.active
            .lock()
            .expect("registry lock")
            .get(stream_id)
            .map(|c| c.call_id.clone())
    }

    pub fn len(&self) -> usize {
        self.active.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_streams() {
        let registry = CallRegistry::new();
        assert!(registry.is_empty());

        registry.insert("MZ1", "CA1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.call_for_stream("MZ1").as_deref(), Some("CA1"));

        let removed = registry.remove("MZ1").unwrap();
        assert_eq!(removed.call_id, "CA1");
        assert!(registry.remove("MZ1").is_none());
        assert!(registry.is_empty());
    }
}
