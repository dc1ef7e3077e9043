use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};

/// Snapshot `len` live bytes at `address`
///
/// # Safety
/// The range must be mapped and readable.
pub unsafe fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(address as *const u8, len).to_vec()
}

/// Pages around `address` could not be made writable. Holds only the OS error code so it can
/// be produced while other threads are suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectError {
    pub address: usize,
    pub code: i32,
}

impl fmt::Display for ProtectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to make {:#x} writable: {}",
            self.address,
            std::io::Error::from_raw_os_error(self.code)
        )
    }
}

impl std::error::Error for ProtectError {}

/// Overwrite code (or any other mapped memory) in the running image. The covering pages are
/// made writable for the duration of the write and then returned to their previous
/// protection. Nothing is written if the protection change fails.
///
/// A write that fits inside one aligned 8 byte word is performed as a single store so a
/// thread executing the bytes concurrently observes either the old or the new word.
///
/// # Safety
/// `address..address + bytes.len()` must be mapped. The caller is responsible for the new
/// bytes making sense to anything executing or reading them.
pub unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<()> {
    try_write_code(address, bytes)?;
    Ok(())
}

/// [`write_code`] for use while other threads are suspended. Does not allocate on Windows,
/// errors are turned into [`anyhow::Error`] by the caller once threads are resumed.
pub(crate) unsafe fn try_write_code(address: usize, bytes: &[u8]) -> Result<(), ProtectError> {
    if bytes.is_empty() {
        return Ok(());
    }

    let unprotected = Unprotected::new(address, bytes.len())?;
    store(address, bytes);
    drop(unprotected);

    flush_instruction_cache(address, bytes.len());
    Ok(())
}

unsafe fn store(address: usize, bytes: &[u8]) {
    let word = address & !7;
    let start = address - word;
    if start + bytes.len() <= 8 {
        let atomic = AtomicU64::from_ptr(word as *mut u64);
        let mut merged = atomic.load(Ordering::SeqCst).to_ne_bytes();
        merged[start..start + bytes.len()].copy_from_slice(bytes);
        atomic.store(u64::from_ne_bytes(merged), Ordering::SeqCst);
    } else {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }
}

/// Displacement for a `rel32` operand of an instruction ending at `next_ip`, if `to` is
/// reachable.
pub fn rel32(next_ip: usize, to: usize) -> Option<i32> {
    i32::try_from((to as i64).wrapping_sub(next_ip as i64)).ok()
}

/// A block of read/write/execute memory. Freed on drop unless leaked.
#[derive(Debug)]
pub struct ExecBlock {
    address: usize,
    size: usize,
}

impl ExecBlock {
    /// Allocate a block anywhere
    pub fn alloc(size: usize) -> Result<Self> {
        match sys::alloc_at(None, size) {
            Some(address) => Ok(Self { address, size }),
            None => bail!("failed to allocate {size:#x} bytes of executable memory"),
        }
    }
    /// Allocate a block at or around `hint`. Whatever the OS hands out is accepted.
    pub(crate) fn alloc_hint(hint: usize, size: usize) -> Option<Self> {
        sys::alloc_at(Some(hint), size).map(|address| Self { address, size })
    }
    /// Allocate a block whose every byte can be reached from `target` with a `rel32`
    /// displacement. Falls back to [`ExecBlock::alloc`] if nothing near is free, check
    /// [`ExecBlock::is_near`] to tell.
    pub fn alloc_near(target: usize, size: usize) -> Result<Self> {
        for hint in sys::near_hints(target) {
            if let Some(address) = sys::alloc_at(Some(hint), size) {
                let block = Self { address, size };
                if block.is_near(target) {
                    return Ok(block);
                }
            }
        }
        tracing::debug!("no free memory near {target:#x}, allocating anywhere");
        Self::alloc(size)
    }
    pub fn address(&self) -> usize {
        self.address
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn is_near(&self, target: usize) -> bool {
        rel32(target + 5, self.address).is_some()
            && rel32(target + 5, self.address + self.size).is_some()
    }
    /// # Safety
    /// Nothing may be executing the overwritten range.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.size {
            bail!(
                "write of {:#x} bytes at {offset:#x} overflows block of {:#x}",
                bytes.len(),
                self.size
            );
        }
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            (self.address + offset) as *mut u8,
            bytes.len(),
        );
        flush_instruction_cache(self.address + offset, bytes.len());
        Ok(())
    }
    /// Keep the block mapped for the rest of the process
    pub fn leak(self) -> usize {
        let address = self.address;
        std::mem::forget(self);
        address
    }
}

impl Drop for ExecBlock {
    fn drop(&mut self) {
        unsafe { sys::free(self.address, self.size) };
    }
}

#[cfg(windows)]
use windows_impl as sys;

#[cfg(windows)]
mod windows_impl {
    use windows::core::HRESULT;
    use windows::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache,
        Memory::{
            VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
            PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
        },
        Threading::GetCurrentProcess,
    };

    use super::ProtectError;

    /// Allocation granularity
    const STEP: usize = 0x1_0000;
    const MAX_DISTANCE: usize = 0x7fff_0000;

    pub fn near_hints(target: usize) -> impl Iterator<Item = usize> {
        let base = target & !(STEP - 1);
        (1..MAX_DISTANCE / STEP).flat_map(move |i| {
            let distance = i * STEP;
            [base.checked_sub(distance), base.checked_add(distance)]
                .into_iter()
                .flatten()
        })
    }

    pub fn alloc_at(hint: Option<usize>, size: usize) -> Option<usize> {
        let address = unsafe {
            VirtualAlloc(
                hint.map(|h| h as *const std::ffi::c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        (!address.is_null()).then_some(address as usize)
    }

    pub unsafe fn free(address: usize, _size: usize) {
        VirtualFree(address as *mut std::ffi::c_void, 0, MEM_RELEASE).ok();
    }

    /// Pages made writable, restored on drop
    pub struct Unprotected {
        address: usize,
        len: usize,
        old: PAGE_PROTECTION_FLAGS,
    }

    /// Win32 error code wrapped in `hr`, or `hr` itself
    fn os_code(hr: HRESULT) -> i32 {
        let hr = hr.0 as u32;
        if hr & 0xffff_0000 == 0x8007_0000 {
            (hr & 0xffff) as i32
        } else {
            hr as i32
        }
    }

    impl Unprotected {
        pub fn new(address: usize, len: usize) -> Result<Self, ProtectError> {
            let mut old = PAGE_PROTECTION_FLAGS(0);
            unsafe {
                VirtualProtect(
                    address as *const std::ffi::c_void,
                    len,
                    PAGE_EXECUTE_READWRITE,
                    &mut old,
                )
            }
            .map_err(|e| ProtectError {
                address,
                code: os_code(e.code()),
            })?;
            Ok(Self { address, len, old })
        }
    }

    impl Drop for Unprotected {
        fn drop(&mut self) {
            let mut old = PAGE_PROTECTION_FLAGS(0);
            // no logging here, this may run while other threads are suspended
            unsafe {
                VirtualProtect(
                    self.address as *const std::ffi::c_void,
                    self.len,
                    self.old,
                    &mut old,
                )
            }
            .ok();
        }
    }

    pub fn flush_instruction_cache(address: usize, len: usize) {
        unsafe {
            FlushInstructionCache(
                GetCurrentProcess(),
                Some(address as *const std::ffi::c_void),
                len,
            )
        }
        .ok();
    }
}

#[cfg(unix)]
use unix_impl as sys;

#[cfg(unix)]
mod unix_impl {
    use super::ProtectError;

    const STEP: usize = 0x100_0000;
    const MAX_DISTANCE: usize = 0x7f00_0000;

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub fn near_hints(target: usize) -> impl Iterator<Item = usize> {
        let base = target & !(STEP - 1);
        (1..MAX_DISTANCE / STEP).flat_map(move |i| {
            let distance = i * STEP;
            [base.checked_sub(distance), base.checked_add(distance)]
                .into_iter()
                .flatten()
        })
    }

    pub fn alloc_at(hint: Option<usize>, size: usize) -> Option<usize> {
        let address = unsafe {
            libc::mmap(
                hint.unwrap_or_default() as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        (address != libc::MAP_FAILED).then_some(address as usize)
    }

    pub unsafe fn free(address: usize, size: usize) {
        libc::munmap(address as *mut libc::c_void, size);
    }

    /// Mapped regions intersecting `start..end` with their current protection, read from
    /// `/proc/self/maps`
    pub fn protections(
        start: usize,
        end: usize,
    ) -> Result<Vec<(usize, usize, i32)>, ProtectError> {
        let error = |code| ProtectError {
            address: start,
            code,
        };
        let maps = std::fs::read_to_string("/proc/self/maps")
            .map_err(|e| error(e.raw_os_error().unwrap_or(libc::EIO)))?;

        let mut regions = vec![];
        for line in maps.lines() {
            let mut parts = line.split_whitespace();
            let (Some(range), Some(perms)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Some((low, high)) = range.split_once('-') else {
                continue;
            };
            let low = usize::from_str_radix(low, 16).map_err(|_| error(libc::EINVAL))?;
            let high = usize::from_str_radix(high, 16).map_err(|_| error(libc::EINVAL))?;
            if high <= start || low >= end {
                continue;
            }

            let perms = perms.as_bytes();
            let mut prot = libc::PROT_NONE;
            if perms.first() == Some(&b'r') {
                prot |= libc::PROT_READ;
            }
            if perms.get(1) == Some(&b'w') {
                prot |= libc::PROT_WRITE;
            }
            if perms.get(2) == Some(&b'x') {
                prot |= libc::PROT_EXEC;
            }
            regions.push((low.max(start), high.min(end), prot));
        }

        let mut covered = start;
        for &(low, high, _) in &regions {
            if low != covered {
                break;
            }
            covered = high;
        }
        // what mprotect reports for unmapped pages
        if covered != end {
            return Err(error(libc::ENOMEM));
        }
        Ok(regions)
    }

    /// Pages made writable, restored on drop
    pub struct Unprotected {
        regions: Vec<(usize, usize, i32)>,
    }

    impl Unprotected {
        pub fn new(address: usize, len: usize) -> Result<Self, ProtectError> {
            let page = page_size();
            let start = address & !(page - 1);
            let end = (address + len + page - 1) & !(page - 1);

            let mut unprotected = Self { regions: vec![] };
            for (low, high, prot) in protections(start, end)? {
                if prot & libc::PROT_WRITE == 0 {
                    let r = unsafe {
                        libc::mprotect(
                            low as *mut libc::c_void,
                            high - low,
                            prot | libc::PROT_WRITE,
                        )
                    };
                    if r != 0 {
                        // already changed regions are restored by drop
                        return Err(ProtectError {
                            address: low,
                            code: std::io::Error::last_os_error()
                                .raw_os_error()
                                .unwrap_or(libc::EIO),
                        });
                    }
                    unprotected.regions.push((low, high, prot));
                }
            }
            Ok(unprotected)
        }
    }

    impl Drop for Unprotected {
        fn drop(&mut self) {
            for &(low, high, prot) in &self.regions {
                let r = unsafe { libc::mprotect(low as *mut libc::c_void, high - low, prot) };
                if r != 0 {
                    tracing::warn!(
                        "failed to restore protection at {low:#x}: {}",
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
    }

    /// Instruction fetch is coherent with stores on x86-64
    pub fn flush_instruction_cache(_address: usize, _len: usize) {}
}

use sys::{flush_instruction_cache, Unprotected};
