pub mod aspect;
pub mod config;
pub mod desktop;
pub mod fix;
pub mod logging;
pub mod signatures;
pub mod state;

#[cfg(windows)]
mod console;
#[cfg(windows)]
mod crash_handler;

pub const FIX_NAME: &str = "HundredLineFix";
pub const FIX_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(windows)]
mod entry {
    use std::path::PathBuf;
    use std::sync::{Arc, OnceLock};

    use anyhow::{Context, Result};
    use fixkit_image::{process::module_path, ModuleImage};
    use tracing::{error, info};
    use windows::Win32::{
        Foundation::HMODULE,
        System::{
            SystemServices::DLL_PROCESS_ATTACH,
            Threading::{GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_HIGHEST},
        },
    };

    use crate::config::{Config, Settings, CONFIG_FILE};
    use crate::fix::Fix;
    use crate::logging::{setup_logging, LOG_FILE};
    use crate::state::FixState;
    use crate::{console, crash_handler, desktop, FIX_NAME, FIX_VERSION};

    /// Installed fixes, kept until the process exits
    static FIX: OnceLock<Fix> = OnceLock::new();

    #[no_mangle]
    #[allow(non_snake_case)]
    extern "system" fn DllMain(dll_module: HMODULE, call_reason: u32, _: *mut ()) -> bool {
        if call_reason == DLL_PROCESS_ATTACH {
            // nothing may wait on the loader lock from here, setup runs once DllMain returns
            let spawned = std::thread::Builder::new()
                .name(FIX_NAME.into())
                .spawn(move || {
                    unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_HIGHEST) }
                        .ok();
                    main(dll_module);
                });
            if spawned.is_err() {
                return false;
            }
        }
        true
    }

    struct Paths {
        fix_dir: PathBuf,
        exe_dir: PathBuf,
    }

    fn paths(dll_module: HMODULE) -> Result<Paths> {
        let dll = module_path(Some(dll_module))?;
        let exe = module_path(None)?;
        Ok(Paths {
            fix_dir: dll.parent().context("DLL has no parent dir")?.to_path_buf(),
            exe_dir: exe.parent().context("exe has no parent dir")?.to_path_buf(),
        })
    }

    fn main(dll_module: HMODULE) {
        let paths = match paths(dll_module) {
            Ok(paths) => paths,
            Err(e) => console::fatal(dll_module, &[format!("{FIX_NAME}: {e:#}")]),
        };

        let log_guard = match setup_logging(&paths.exe_dir) {
            Ok(guard) => guard,
            Err(e) => console::fatal(
                dll_module,
                &[format!("Log initialisation failed: {e:#}")],
            ),
        };

        let exe = match ModuleImage::main_module() {
            Ok(exe) => exe,
            Err(e) => {
                error!("Failed to read game module: {e:#}");
                drop(log_guard);
                console::fatal(dll_module, &[format!("{FIX_NAME}: {e:#}")]);
            }
        };

        info!("----------");
        info!("{FIX_NAME} v{FIX_VERSION} loaded.");
        info!("----------");
        info!("Log file: {}", paths.exe_dir.join(LOG_FILE).display());
        info!("----------");
        info!("Module Name: {}", exe.name());
        info!("Module Path: {}", paths.exe_dir.display());
        info!("Module Address: {:#x}", exe.base());
        info!("Module Timestamp: {}", exe.timestamp());
        info!("----------");

        let config_path = paths.fix_dir.join(CONFIG_FILE);
        let config = match Config::load(&config_path) {
            Ok(config) => {
                info!("Config file: {}", config_path.display());
                config
            }
            Err(e) => {
                error!("ERROR: Could not load config file {CONFIG_FILE}: {e:#}");
                drop(log_guard);
                console::fatal(
                    dll_module,
                    &[
                        format!("{FIX_NAME} v{FIX_VERSION} loaded."),
                        "ERROR: Could not load config file.".to_string(),
                        format!("ERROR: {e:#}"),
                        format!(
                            "ERROR: Make sure {CONFIG_FILE} is located in {}",
                            paths.fix_dir.display()
                        ),
                    ],
                );
            }
        };

        let settings = Settings::from_config(&config)
            .with_desktop_fallback(desktop::physical_desktop_dimensions());

        // not before this point: the fatal paths above unload the DLL, and a handler left
        // registered would be called at an unmapped address on the host's next exception
        unsafe { crash_handler::setup_windows_exception_handler(&exe) };

        let state = Arc::new(FixState::new(settings));
        let fix = unsafe { Fix::apply(&exe, state) };
        info!("{} hooks installed", fix.hooks().len());
        if FIX.set(fix).is_err() {
            error!("{FIX_NAME} was initialised twice");
        }

        // keep logging for the rest of the process
        std::mem::forget(log_guard);
    }
}
