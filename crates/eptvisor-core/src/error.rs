use crate::{Pa, Va};

/// An error that can occur while operating the hypervisor.
#[derive(thiserror::Error, Debug)]
pub enum HvError {
    /// The processor does not implement VMX.
    #[error("VMX not supported on this processor")]
    VmxNotSupported,

    /// VMX is implemented but locked off by the firmware.
    #[error("VMX not enabled by the firmware")]
    VmxDisabled,

    /// A VMX capability required by the hypervisor is missing.
    #[error("Unsupported VMX capability: {0}")]
    VmxCapability(&'static str),

    /// A VMX instruction reported failure.
    #[error("{instruction} failed (error {code})")]
    VmxInstruction {
        /// The failing instruction.
        instruction: &'static str,

        /// The VM-instruction error number, or zero if none was reported.
        code: u32,
    },

    /// One or more cores failed to enter VMX root mode.
    #[error("Hypervisor failed to start on {failed} of {total} cores")]
    CoreEnable {
        /// Number of cores that failed.
        failed: usize,

        /// Number of cores the operation was attempted on.
        total: usize,
    },

    /// A page-aligned allocation could not be satisfied.
    #[error("Out of memory")]
    OutOfMemory,

    /// A bounded table is full.
    #[error("Capacity of {limit} {kind} exceeded")]
    CapacityExceeded {
        /// The kind of record.
        kind: &'static str,

        /// The configured limit.
        limit: usize,
    },

    /// The hook would cross a page boundary.
    #[error("Hook at offset {offset:#x} with length {length} crosses a page boundary")]
    PageBoundary {
        /// Offset of the hook within its page.
        offset: u64,

        /// Length of the hook payload.
        length: usize,
    },

    /// The hook payload is empty.
    #[error("Empty hook payload")]
    EmptyPayload,

    /// The virtual address has no physical backing.
    #[error("No physical address for {0}")]
    TranslationFailed(Va),

    /// The virtual range wraps around the end of the address space.
    #[error("Range at {address} with length {length:#x} wraps the address space")]
    RangeOverflow {
        /// First byte of the range.
        address: Va,

        /// Length of the range in bytes.
        length: usize,
    },

    /// The physical address lies outside the identity map.
    #[error("Physical address {0} is not covered by the EPT")]
    AddressOutOfRange(Pa),

    /// The page already carries a record of the other kind.
    #[error("Page {0} is already hooked or watched")]
    PageInUse(Pa),

    /// The EPT has not been initialized.
    #[error("EPT not initialized")]
    NotInitialized,

    /// Only one hypervisor may exist at a time.
    #[error("Hypervisor already instantiated")]
    AlreadyInstantiated,

    /// The record was not found.
    #[error("Not found")]
    NotFound,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl HvError {
    /// Creates a VMX instruction failure without an error number.
    pub fn vmx(instruction: &'static str) -> Self {
        Self::VmxInstruction {
            instruction,
            code: 0,
        }
    }
}

impl From<zerocopy::AllocError> for HvError {
    fn from(_: zerocopy::AllocError) -> Self {
        Self::OutOfMemory
    }
}

/// A condition the hypervisor cannot recover from.
///
/// These are never returned as errors. They are raised through the platform's
/// bugcheck primitive or end the virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCondition {
    /// The EPT contains a malformed entry.
    EptMisconfiguration {
        /// The guest-physical address of the access.
        address: Pa,
    },

    /// An EPT violation hit a page the hypervisor does not manage.
    UnexpectedViolation {
        /// The guest-physical address of the access.
        address: Pa,

        /// The exit qualification.
        qualification: u64,
    },

    /// A core is still in VMX operation after it was told to leave.
    StuckCore {
        /// The logical processor index.
        core: usize,
    },

    /// A VM exit arrived on a processor without per-core state.
    UnknownProcessor {
        /// The logical processor index.
        core: usize,
    },
}

impl FatalCondition {
    /// Returns the bugcheck parameter identifying the condition.
    pub fn code(self) -> u64 {
        match self {
            Self::EptMisconfiguration { .. } => 1,
            Self::UnexpectedViolation { .. } => 2,
            Self::StuckCore { .. } => 3,
            Self::UnknownProcessor { .. } => 4,
        }
    }
}

impl std::fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::EptMisconfiguration { address } => {
                write!(f, "EPT misconfiguration at {address}")
            }
            Self::UnexpectedViolation {
                address,
                qualification,
            } => write!(
                f,
                "unexpected EPT violation at {address} (qualification {qualification:#x})"
            ),
            Self::StuckCore { core } => write!(f, "core {core} did not leave VMX operation"),
            Self::UnknownProcessor { core } => write!(f, "VM exit on unknown core {core}"),
        }
    }
}
