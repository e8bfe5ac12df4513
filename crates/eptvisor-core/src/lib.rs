//! Core types shared by the eptvisor crates.

mod config;
mod core;
mod error;
mod page;

pub use self::{
    config::{HypervisorConfig, Traversal},
    core::{Gfn, MemoryAccess, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, Pa, ProcessId, Va},
    error::{FatalCondition, HvError},
    page::{Page, allocate_zeroed},
};
