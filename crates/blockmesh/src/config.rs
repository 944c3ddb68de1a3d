//! `Master` construction knobs, kept in their own small struct the way the
//! teacher keeps a `Config` holder separate from the thing it configures.

/// Settings a `Master` is built with. No environment variables or CLI
/// parsing live here — this struct only defines the knobs and their
/// defaults; wiring them up from a config file or flags is an application
/// concern, not the core's.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub threads: usize,
    pub in_memory_limit: usize,
    pub immediate: bool,
    pub queue_policy: crate::queue::SpillPolicy,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            threads: 1,
            in_memory_limit: usize::MAX,
            immediate: false,
            queue_policy: crate::queue::SpillPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original() {
        let config = MasterConfig::default();
        assert_eq!(config.threads, 1);
        assert_eq!(config.in_memory_limit, usize::MAX);
        assert!(!config.immediate);
    }
}
