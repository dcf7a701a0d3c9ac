//! Runtime-configurable parameters for world construction.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `RUMOR_`) or by constructing a custom `WorldConfig`.

/// Tuning parameters for a [`World`](crate::World).
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Number of ranks (threads) in the world.
    pub ranks: u32,

    /// Stack size for each rank thread. `None` uses the platform default.
    pub thread_stack_bytes: Option<usize>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            ranks: 4,
            thread_stack_bytes: None,
        }
    }
}

impl WorldConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RUMOR_RANKS`
    /// - `RUMOR_STACK_BYTES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("RUMOR_RANKS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.ranks = n;
            }
        }
        if let Ok(v) = std::env::var("RUMOR_STACK_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.thread_stack_bytes = Some(n);
            }
        }

        cfg
    }
}
