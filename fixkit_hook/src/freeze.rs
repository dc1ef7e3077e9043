//! Keeping other threads out of code while it is rewritten.
//!
//! Nothing in here may allocate or log while threads are suspended: a suspended thread
//! could be holding the heap lock.

#[cfg(windows)]
pub(crate) use windows_impl::Frozen;

#[cfg(windows)]
mod windows_impl {
    use anyhow::Result;
    use windows::Win32::{
        Foundation::{CloseHandle, HANDLE},
        System::{
            Diagnostics::{
                Debug::{GetThreadContext, SetThreadContext, CONTEXT, CONTEXT_CONTROL_AMD64},
                ToolHelp::{
                    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD,
                    THREADENTRY32,
                },
            },
            Threading::{
                GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread,
                THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT,
                THREAD_SUSPEND_RESUME,
            },
        },
    };

    /// Every other thread of the process, suspended until drop
    pub(crate) struct Frozen {
        threads: Vec<HANDLE>,
    }

    fn other_thread_ids() -> Result<Vec<u32>> {
        let process = unsafe { GetCurrentProcessId() };
        let current = unsafe { GetCurrentThreadId() };

        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }?;
        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        let mut ids = vec![];
        let mut next = unsafe { Thread32First(snapshot, &mut entry) };
        while next.is_ok() {
            if entry.th32OwnerProcessID == process && entry.th32ThreadID != current {
                ids.push(entry.th32ThreadID);
            }
            next = unsafe { Thread32Next(snapshot, &mut entry) };
        }
        unsafe { CloseHandle(snapshot) }.ok();
        Ok(ids)
    }

    impl Frozen {
        pub(crate) fn other_threads() -> Result<Self> {
            let ids = other_thread_ids()?;
            let mut threads = Vec::with_capacity(ids.len());
            for id in ids {
                let access = THREAD_SUSPEND_RESUME
                    | THREAD_GET_CONTEXT
                    | THREAD_SET_CONTEXT
                    | THREAD_QUERY_INFORMATION;
                // threads may have exited since the snapshot
                let Ok(thread) = (unsafe { OpenThread(access, false, id) }) else {
                    continue;
                };
                if unsafe { SuspendThread(thread) } == u32::MAX {
                    unsafe { CloseHandle(thread) }.ok();
                    continue;
                }
                threads.push(thread);
            }
            Ok(Self { threads })
        }

        /// Move every suspended thread whose instruction pointer `map` knows about.
        /// Returns how many were moved.
        pub(crate) fn relocate(&self, map: impl Fn(usize) -> Option<usize>) -> usize {
            let mut moved = 0;
            for &thread in &self.threads {
                let mut context = CONTEXT {
                    ContextFlags: CONTEXT_CONTROL_AMD64,
                    ..Default::default()
                };
                // also waits for the suspension to take effect
                if unsafe { GetThreadContext(thread, &mut context) }.is_err() {
                    continue;
                }
                if let Some(rip) = map(context.Rip as usize) {
                    context.Rip = rip as u64;
                    if unsafe { SetThreadContext(thread, &context) }.is_ok() {
                        moved += 1;
                    }
                }
            }
            moved
        }
    }

    impl Drop for Frozen {
        fn drop(&mut self) {
            for &thread in &self.threads {
                unsafe {
                    ResumeThread(thread);
                    CloseHandle(thread).ok();
                }
            }
        }
    }
}

#[cfg(not(windows))]
pub(crate) use other_impl::Frozen;

/// Threads are not suspended here. Patches that fit in one aligned word are written with a
/// single store instead, see [`crate::memory::write_code`].
#[cfg(not(windows))]
mod other_impl {
    use anyhow::Result;

    pub(crate) struct Frozen;

    impl Frozen {
        pub(crate) fn other_threads() -> Result<Self> {
            Ok(Self)
        }
        pub(crate) fn relocate(&self, _map: impl Fn(usize) -> Option<usize>) -> usize {
            0
        }
    }
}

/// Map an instruction pointer through (original, relocated) `pairs`, in either direction
pub(crate) fn lookup(
    pairs: &[(usize, usize)],
    ip: usize,
    from_original: bool,
) -> Option<usize> {
    pairs.iter().find_map(|&(original, relocated)| {
        let (from, to) = if from_original {
            (original, relocated)
        } else {
            (relocated, original)
        };
        (from == ip).then_some(to)
    })
}
