mod address;
pub(crate) mod macros;
mod memory_access;
mod process;

pub use self::{
    address::{Gfn, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, Pa, Va},
    memory_access::MemoryAccess,
    process::ProcessId,
};
