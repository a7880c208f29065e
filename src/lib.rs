//! `dynhook` — live function hooking on a running Linux x86-64 process via
//! `ptrace`. See spec.md for the component breakdown (C1-C7); each module
//! below corresponds to one component.

pub mod allocator;
pub mod asm;
pub mod consts;
pub mod debug;
pub mod decoder;
pub mod error;
pub mod invoke;
pub mod logging;
pub mod patch;
pub mod proc;
pub mod process_info;
pub mod remote;
pub mod stubs;
pub mod symbols;
pub mod tasks;

pub use allocator::RemoteAllocator;
pub use error::{DynhookError, Result};
pub use invoke::{invoke, invoke_scratch};
pub use patch::{Patch, PatchManager, PatchState};
pub use process_info::ProcessInfo;
pub use stubs::Stub;
