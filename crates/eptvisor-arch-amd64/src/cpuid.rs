/// Register output of the CPUID instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    /// EAX.
    pub eax: u32,

    /// EBX.
    pub ebx: u32,

    /// ECX.
    pub ecx: u32,

    /// EDX.
    pub edx: u32,
}

impl CpuidResult {
    /// Leaf reporting processor feature flags.
    pub const FEATURE_INFORMATION: u32 = 0x1;

    /// Leaf reporting the hypervisor interface signature.
    pub const HYPERVISOR_INTERFACE: u32 = 0x4000_0001;

    /// ECX bit of [`FEATURE_INFORMATION`] reporting VMX support.
    ///
    /// [`FEATURE_INFORMATION`]: Self::FEATURE_INFORMATION
    pub const VMX: u32 = 1 << 5;

    /// ECX bit of [`FEATURE_INFORMATION`] reserved for hypervisors.
    ///
    /// [`FEATURE_INFORMATION`]: Self::FEATURE_INFORMATION
    pub const HYPERVISOR_PRESENT: u32 = 1 << 31;

    /// Checks if [`VMX`](Self::VMX) is set, assuming this is the output of
    /// leaf 1.
    pub fn vmx(&self) -> bool {
        self.ecx & Self::VMX != 0
    }

    /// Checks if [`HYPERVISOR_PRESENT`](Self::HYPERVISOR_PRESENT) is set,
    /// assuming this is the output of leaf 1.
    pub fn hypervisor_present(&self) -> bool {
        self.ecx & Self::HYPERVISOR_PRESENT != 0
    }
}
