//! Runs per-core routines on every logical processor.

use eptvisor_core::{HvError, Traversal};

use crate::platform::{CoreRoutine, ProcessorDispatch};

impl<F> CoreRoutine for F
where
    F: Fn(usize) -> Result<(), HvError> + Sync,
{
    fn run(&self, core: usize) -> Result<(), HvError> {
        self(core)
    }
}

/// A routine that failed on one processor.
#[derive(Debug)]
pub struct CoreFailure {
    /// The logical processor index.
    pub core: usize,

    /// The error the routine returned.
    pub error: HvError,
}

/// Outcome of a [`broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Number of processors the routine ran on.
    pub total: usize,

    /// Processors on which the routine failed, in visiting order.
    pub failures: Vec<CoreFailure>,
}

impl BroadcastReport {
    /// Checks if the routine succeeded everywhere.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts the report into a single result.
    pub fn into_result(self) -> Result<(), HvError> {
        if self.is_success() {
            return Ok(());
        }

        Err(HvError::CoreEnable {
            failed: self.failures.len(),
            total: self.total,
        })
    }
}

/// Returns the processor indices in visiting order.
pub fn core_order(count: usize, traversal: Traversal) -> Vec<usize> {
    match traversal {
        Traversal::Ascending => (0..count).collect(),
        Traversal::Descending => (0..count).rev().collect(),
    }
}

/// Runs `routine` on every logical processor, one at a time.
///
/// Each run completes before the next processor is visited, and every
/// processor is visited even after a failure. When this returns, no
/// processor is still executing the routine.
pub fn broadcast(
    dispatch: &(impl ProcessorDispatch + ?Sized),
    traversal: Traversal,
    routine: &dyn CoreRoutine,
) -> BroadcastReport {
    let order = core_order(dispatch.processor_count(), traversal);
    let mut report = BroadcastReport {
        total: order.len(),
        failures: Vec::new(),
    };

    for core in order {
        if let Err(error) = dispatch.run_on(core, routine) {
            tracing::warn!(core, %error, "per-core routine failed");
            report.failures.push(CoreFailure { core, error });
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mock::MockPlatform;

    #[test]
    fn order_follows_traversal() {
        assert_eq!(core_order(4, Traversal::Ascending), [0, 1, 2, 3]);
        assert_eq!(core_order(4, Traversal::Descending), [3, 2, 1, 0]);
        assert!(core_order(0, Traversal::Descending).is_empty());
    }

    #[test]
    fn broadcast_runs_on_every_core() -> Result<(), HvError> {
        let platform = MockPlatform::new(3);
        let visited = Mutex::new(Vec::new());

        let routine = |core: usize| {
            assert_eq!(platform.current_processor(), core);
            visited.lock().map_err(|_| HvError::Other("poisoned"))?.push(core);
            Ok(())
        };

        let report = broadcast(&platform, Traversal::Descending, &routine);
        assert!(report.is_success());
        assert_eq!(report.total, 3);
        assert_eq!(*visited.lock().map_err(|_| HvError::Other("poisoned"))?, [2, 1, 0]);

        // The caller's processor is restored.
        assert_eq!(platform.current_processor(), 0);
        report.into_result()
    }

    #[test]
    fn broadcast_collects_failures() {
        let platform = MockPlatform::new(4);

        let routine = |core: usize| match core {
            1 | 3 => Err(HvError::vmx("vmxon")),
            _ => Ok(()),
        };

        let report = broadcast(&platform, Traversal::Ascending, &routine);
        assert!(!report.is_success());

        let failed = report
            .failures
            .iter()
            .map(|failure| failure.core)
            .collect::<Vec<_>>();
        assert_eq!(failed, [1, 3]);

        assert!(matches!(
            report.into_result(),
            Err(HvError::CoreEnable {
                failed: 2,
                total: 4
            })
        ));
    }
}
