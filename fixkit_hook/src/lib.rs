//! Live code modification for the current process: byte patches and mid-function hooks
//! that hand the callback the full register state.

pub mod context;
mod freeze;
pub mod memory;
pub mod mid;
pub mod patch;
mod trampoline;

pub use context::{Context, Registers, Xmm};
pub use mid::{Callback, MidHook};
pub use patch::patch_bytes;
