use serde::{Deserialize, Serialize};

/// Order in which logical processors are visited by cross-core operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Traversal {
    /// From processor 0 upwards.
    #[default]
    Ascending,

    /// From the highest processor index downwards.
    Descending,
}

/// Runtime configuration of the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Maximum number of hooked pages.
    pub max_hooks: usize,

    /// Maximum number of watched pages.
    pub max_watchpoints: usize,

    /// Number of instruction pointers retained by the access ring.
    pub access_ring_capacity: usize,

    /// Virtual processor identifier used when VPID is available.
    pub vpid: u16,

    /// Requests syscall interception on every core after launch.
    pub syscall_hooks: bool,

    /// Processor order used when entering VMX operation.
    pub enable_traversal: Traversal,

    /// Processor order used when leaving VMX operation.
    pub disable_traversal: Traversal,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            max_hooks: 64,
            max_watchpoints: 32,
            access_ring_capacity: 1024,
            vpid: 1,
            syscall_hooks: false,
            enable_traversal: Traversal::Ascending,
            disable_traversal: Traversal::Descending,
        }
    }
}

impl HypervisorConfig {
    /// Sets the maximum number of hooked pages.
    pub fn with_max_hooks(self, max_hooks: usize) -> Self {
        Self { max_hooks, ..self }
    }

    /// Sets the maximum number of watched pages.
    pub fn with_max_watchpoints(self, max_watchpoints: usize) -> Self {
        Self {
            max_watchpoints,
            ..self
        }
    }

    /// Sets the access ring capacity.
    pub fn with_access_ring_capacity(self, access_ring_capacity: usize) -> Self {
        Self {
            access_ring_capacity,
            ..self
        }
    }

    /// Enables or disables syscall interception at launch.
    pub fn with_syscall_hooks(self, syscall_hooks: bool) -> Self {
        Self {
            syscall_hooks,
            ..self
        }
    }

    /// Sets the processor orders used when entering and leaving VMX operation.
    pub fn with_traversal(self, enable: Traversal, disable: Traversal) -> Self {
        Self {
            enable_traversal: enable,
            disable_traversal: disable,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HypervisorConfig::default();
        assert_eq!(config.max_hooks, 64);
        assert_eq!(config.max_watchpoints, 32);
        assert_eq!(config.access_ring_capacity, 1024);
        assert_eq!(config.vpid, 1);
        assert!(!config.syscall_hooks);
        assert_eq!(config.enable_traversal, Traversal::Ascending);
        assert_eq!(config.disable_traversal, Traversal::Descending);
    }

    #[test]
    fn builders() {
        let config = HypervisorConfig::default()
            .with_max_hooks(4)
            .with_max_watchpoints(2)
            .with_access_ring_capacity(8)
            .with_syscall_hooks(true)
            .with_traversal(Traversal::Descending, Traversal::Ascending);

        assert_eq!(config.max_hooks, 4);
        assert_eq!(config.max_watchpoints, 2);
        assert_eq!(config.access_ring_capacity, 8);
        assert!(config.syscall_hooks);
        assert_eq!(config.enable_traversal, Traversal::Descending);
        assert_eq!(config.disable_traversal, Traversal::Ascending);
    }
}
