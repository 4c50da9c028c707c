//! Feature gating for mutating operations.

use std::{collections::HashSet, sync::Arc};

use crate::{
    core::config::FeatureConfig,
    error::{ResourceError, ResourceResult},
};

/// Flag names consulted by each manager.
pub mod flags {
    pub const CONNECTION_POOL: &str = "connection_pool";
    pub const COMMAND_QUEUE: &str = "command_queue";
    pub const CACHE_MANAGER: &str = "cache_manager";
    pub const SESSION_MANAGER: &str = "session_manager";

    pub const ALL: [&str; 4] = [
        CONNECTION_POOL,
        COMMAND_QUEUE,
        CACHE_MANAGER,
        SESSION_MANAGER,
    ];
}

pub trait FeatureGate: Send + Sync {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Gate that never closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysEnabled;

impl FeatureGate for AlwaysEnabled {
    fn is_enabled(&self, _flag: &str) -> bool {
        true
    }
}

/// Gate that closes every flag; used by the inert layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllDisabled;

impl FeatureGate for AllDisabled {
    fn is_enabled(&self, _flag: &str) -> bool {
        false
    }
}

/// Gate with a fixed set of disabled flags.
#[derive(Debug, Default, Clone)]
pub struct StaticFeatureGate {
    disabled: HashSet<String>,
}

impl StaticFeatureGate {
    pub fn new<I, S>(disabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            disabled: disabled.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &FeatureConfig) -> Self {
        Self::new(config.disabled.iter().cloned())
    }
}

impl FeatureGate for StaticFeatureGate {
    fn is_enabled(&self, flag: &str) -> bool {
        !self.disabled.contains(flag)
    }
}

/// Config overrides on top of a host-provided gate. A flag is enabled only
/// when both agree.
pub struct LayeredGate {
    overrides: StaticFeatureGate,
    inner: Arc<dyn FeatureGate>,
}

impl LayeredGate {
    pub fn new(overrides: StaticFeatureGate, inner: Arc<dyn FeatureGate>) -> Self {
        Self { overrides, inner }
    }
}

impl FeatureGate for LayeredGate {
    fn is_enabled(&self, flag: &str) -> bool {
        self.overrides.is_enabled(flag) && self.inner.is_enabled(flag)
    }
}

/// `Err(Disabled)` when `flag` is closed.
pub(crate) fn ensure_enabled(gate: &dyn FeatureGate, flag: &str) -> ResourceResult<()> {
    if gate.is_enabled(flag) {
        Ok(())
    } else {
        Err(ResourceError::Disabled(flag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_gate() {
        let gate = StaticFeatureGate::new([flags::CACHE_MANAGER]);
        assert!(!gate.is_enabled(flags::CACHE_MANAGER));
        assert!(gate.is_enabled(flags::COMMAND_QUEUE));
    }

    #[test]
    fn test_gate_from_config() {
        let config = FeatureConfig {
            disabled: vec!["session_manager".into()],
        };
        let gate = StaticFeatureGate::from_config(&config);
        assert!(!gate.is_enabled(flags::SESSION_MANAGER));
        assert!(gate.is_enabled(flags::CONNECTION_POOL));
    }

    #[test]
    fn test_layered_gate_requires_both() {
        let gate = LayeredGate::new(
            StaticFeatureGate::new([flags::CACHE_MANAGER]),
            Arc::new(StaticFeatureGate::new([flags::COMMAND_QUEUE])),
        );
        assert!(!gate.is_enabled(flags::CACHE_MANAGER));
        assert!(!gate.is_enabled(flags::COMMAND_QUEUE));
        assert!(gate.is_enabled(flags::SESSION_MANAGER));
    }

    #[test]
    fn test_ensure_enabled_reason() {
        assert!(ensure_enabled(&AlwaysEnabled, flags::COMMAND_QUEUE).is_ok());
        let err = ensure_enabled(&AllDisabled, flags::COMMAND_QUEUE).unwrap_err();
        assert_eq!(err.reason(), "disabled");
        assert!(flags::ALL.iter().all(|flag| !AllDisabled.is_enabled(flag)));
    }
}
