#[cfg(windows)]
pub use windows_impl::*;

#[cfg(windows)]
mod windows_impl {
    use std::path::PathBuf;

    use anyhow::{bail, Context, Result};
    use windows::Win32::{
        Foundation::HMODULE,
        System::{
            LibraryLoader::{GetModuleFileNameW, GetModuleHandleW},
            ProcessStatus::{GetModuleInformation, MODULEINFO},
            Threading::GetCurrentProcess,
        },
    };

    use crate::ModuleImage;

    /// Full path of a loaded module. Pass `None` for the main executable.
    pub fn module_path(module: Option<HMODULE>) -> Result<PathBuf> {
        let mut buffer = vec![0u16; 260];
        loop {
            let len = unsafe { GetModuleFileNameW(module.unwrap_or_default(), &mut buffer) }
                as usize;
            if len == 0 {
                bail!(
                    "GetModuleFileNameW failed: {}",
                    windows::core::Error::from_win32()
                );
            }
            // a full buffer means the path was truncated
            if len < buffer.len() {
                buffer.truncate(len);
                return Ok(PathBuf::from(String::from_utf16_lossy(&buffer)));
            }
            buffer.resize(buffer.len() * 2, 0);
        }
    }

    impl ModuleImage<'static> {
        /// The executable module of the current process
        pub fn main_module() -> Result<Self> {
            let main_module =
                unsafe { GetModuleHandleW(None) }.context("could not find main module")?;
            Self::from_handle(main_module)
        }

        /// A module already loaded into the current process. The handle must stay loaded for
        /// the rest of the process' lifetime.
        pub fn from_handle(module: HMODULE) -> Result<Self> {
            let process = unsafe { GetCurrentProcess() };

            let mut mod_info = MODULEINFO::default();
            unsafe {
                GetModuleInformation(
                    process,
                    module,
                    &mut mod_info as *mut _,
                    std::mem::size_of::<MODULEINFO>() as u32,
                )?
            };

            let memory = unsafe {
                std::slice::from_raw_parts(
                    mod_info.lpBaseOfDll as *const u8,
                    mod_info.SizeOfImage as usize,
                )
            };

            let path = module_path(Some(module))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let image = ModuleImage::from_memory(name, memory)?.with_path(path);
            tracing::debug!("read module {image:?}");
            Ok(image)
        }
    }
}
