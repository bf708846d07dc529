//! Runtime configuration. Defaults match an informer with no periodic resync.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    /// Period of the full relist-and-diff cycle; `None` disables it.
    pub resync_period: Option<Duration>,
    /// Cap for the exponential backoff between watch restarts.
    pub watch_backoff_max: Duration,
    /// Emit `Replaced` (rather than `Sync`) for changed objects of a fresh listing.
    pub emit_replaced: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self { resync_period: None, watch_backoff_max: Duration::from_secs(30), emit_replaced: true }
    }
}

impl MirrorConfig {
    /// Read `MIRRA_RESYNC_SECS` (0 = off), `MIRRA_WATCH_BACKOFF_MAX_SECS`, `MIRRA_EMIT_REPLACED`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = get("MIRRA_RESYNC_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.resync_period = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = get("MIRRA_WATCH_BACKOFF_MAX_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.watch_backoff_max = Duration::from_secs(secs.max(1));
        }
        if let Some(v) = get("MIRRA_EMIT_REPLACED") {
            cfg.emit_replaced = !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
        }
        cfg
    }

    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period.filter(|p| !p.is_zero());
        self
    }
}
