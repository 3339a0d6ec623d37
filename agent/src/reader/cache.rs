//! Scan dedup cache
//!
//! The polling loop sees the same card dozens of times per second; only
//! changes flow to the bridge. The cache also backs the card-presence
//! reconciliation: a card counts as present while a scan landed within the
//! presence window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct TagCache {
    entries: HashMap<String, String>,
    last_seen_at: Option<Instant>,
    presence_window: Duration,
}

impl TagCache {
    pub fn new(presence_window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            last_seen_at: None,
            presence_window,
        }
    }

    /// Record a scan of `(uid, text)`. Returns `true` when this pair was not
    /// the last thing seen for that UID — the emission gate.
    pub fn has_changed(&mut self, uid: &str, text: &str) -> bool {
        match self.entries.get(uid) {
            Some(prev) if prev == text => false,
            _ => {
                self.entries.insert(uid.to_string(), text.to_string());
                true
            }
        }
    }

    /// Note that some tag was visible on this poll.
    pub fn mark_seen(&mut self) {
        self.last_seen_at = Some(Instant::now());
    }

    /// True while the last sighting is within the presence window.
    pub fn is_card_present(&self) -> bool {
        self.last_seen_at
            .is_some_and(|t| t.elapsed() < self.presence_window)
    }

    /// Forget everything; used when the device reconnects so the next scan
    /// of a known card is re-emitted.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_seen_at = None;
    }
}
