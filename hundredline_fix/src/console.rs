use std::io::Write;

use windows::Win32::{
    Foundation::HMODULE,
    System::{Console::AllocConsole, LibraryLoader::FreeLibraryAndExitThread},
};

/// Show `lines` in a console window and unload the DLL, ending the calling thread. Used when
/// there is no log file to report to or nothing sensible left to do.
pub fn fatal(module: HMODULE, lines: &[String]) -> ! {
    unsafe { AllocConsole() }.ok();
    if let Ok(mut console) = std::fs::OpenOptions::new().write(true).open("CONOUT$") {
        for line in lines {
            writeln!(console, "{line}").ok();
        }
    }
    unsafe { FreeLibraryAndExitThread(module, 1) }
}
