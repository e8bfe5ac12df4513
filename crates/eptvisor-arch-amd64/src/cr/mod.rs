mod cr0;
mod cr3;
mod cr4;

pub use self::{cr0::Cr0, cr3::Cr3, cr4::Cr4};

/// Applies the `IA32_VMX_CRx_FIXED0` / `IA32_VMX_CRx_FIXED1` pair to a
/// control register value.
///
/// Bits set in `fixed0` must be one in VMX operation, bits clear in `fixed1`
/// must be zero.
pub(crate) fn apply_fixed_bits(value: u64, fixed0: u64, fixed1: u64) -> u64 {
    value & fixed1 | fixed0
}
