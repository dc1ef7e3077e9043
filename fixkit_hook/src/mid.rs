use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{Context as _, Result};
use tracing::{debug, error};

use crate::context::{Context, Registers};
use crate::freeze::{lookup, Frozen};
use crate::memory::{read_bytes, try_write_code, ExecBlock};
use crate::trampoline;

/// Hook callbacks may run on any host thread, several at once
pub type Callback = Box<dyn Fn(&mut Context) + Send + Sync>;

const TRAMPOLINE_SIZE: usize = 0x1000;

/// A callback invoked every time the host executes `target`, before the instruction at
/// `target` runs.
///
/// Dropping the hook restores the original bytes. The trampoline and callback stay
/// allocated since a host thread could still be running inside them.
#[derive(Debug)]
pub struct MidHook {
    target: usize,
    original: Vec<u8>,
    trampoline: usize,
    near: bool,
    relocated: Vec<(usize, usize)>,
}

impl MidHook {
    /// # Safety
    /// `target` must be the start of an instruction in mapped code, and the instructions
    /// covering the redirect must not be jumped into from elsewhere.
    pub unsafe fn install<F>(target: usize, callback: F) -> Result<Self>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        let block = ExecBlock::alloc_near(target, TRAMPOLINE_SIZE)?;
        Self::install_with_block(target, block, callback)
    }

    /// [`MidHook::install`] with the trampoline placed in `block`, near or not
    pub(crate) unsafe fn install_with_block<F>(
        target: usize,
        block: ExecBlock,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        let redirect_len = trampoline::redirect_len(target, block.address());
        let near = redirect_len == 5;

        let stolen = trampoline::stolen_instructions(target, redirect_len)
            .with_context(|| format!("failed to relocate instructions at {target:#x}"))?;
        let stolen_len = stolen.iter().map(|i| i.len()).sum::<usize>();

        let callback: Box<Callback> = Box::new(Box::new(callback));
        let dispatch = dispatch as extern "C" fn(*mut Registers, *const Callback) as usize;
        let code = trampoline::assemble(
            block.address(),
            target,
            &stolen,
            dispatch,
            &*callback as *const Callback as usize,
        )?;
        block.write(0, &code.code)?;

        let redirect = trampoline::redirect(target, block.address(), stolen_len);
        let original = read_bytes(target, stolen_len);

        let frozen = Frozen::other_threads()?;
        // a thread sitting exactly at `target` takes the redirect like any other
        let moved = frozen.relocate(|ip| {
            (ip != target)
                .then(|| lookup(&code.relocated, ip, true))
                .flatten()
        });
        let written = try_write_code(target, &redirect);
        drop(frozen);
        written.with_context(|| format!("failed to write redirect at {target:#x}"))?;

        let trampoline = block.leak();
        Box::leak(callback);

        debug!(
            "installed mid hook at {target:#x}: trampoline {trampoline:#x}, {stolen_len} bytes \
             relocated, {moved} threads moved"
        );

        Ok(Self {
            target,
            original,
            trampoline,
            near,
            relocated: code.relocated,
        })
    }
    pub fn target(&self) -> usize {
        self.target
    }
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }
    /// Length of the instructions moved into the trampoline
    pub fn stolen_len(&self) -> usize {
        self.original.len()
    }
    /// Whether the trampoline is in `rel32` range of the target
    pub fn is_near(&self) -> bool {
        self.near
    }
}

impl Drop for MidHook {
    fn drop(&mut self) {
        let frozen = match Frozen::other_threads() {
            Ok(frozen) => frozen,
            Err(e) => {
                error!("failed to remove mid hook at {:#x}: {e:#}", self.target);
                return;
            }
        };
        frozen.relocate(|ip| lookup(&self.relocated, ip, false));
        let restored = unsafe { try_write_code(self.target, &self.original) };
        drop(frozen);

        match restored {
            Ok(()) => debug!("removed mid hook at {:#x}", self.target),
            Err(e) => error!("failed to remove mid hook at {:#x}: {e:#}", self.target),
        }
    }
}

extern "C" fn dispatch(registers: *mut Registers, callback: *const Callback) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let (registers, callback) = unsafe { (&mut *registers, &*callback) };
        callback(&mut Context::new(registers));
    }));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic>");
        error!("mid hook callback panicked: {message}");
    }
}
