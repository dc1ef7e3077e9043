use std::sync::OnceLock;

use windows::Win32::{
    Foundation::{
        DBG_PRINTEXCEPTION_C, DBG_PRINTEXCEPTION_WIDE_C, EXCEPTION_ACCESS_VIOLATION,
        EXCEPTION_ARRAY_BOUNDS_EXCEEDED, EXCEPTION_BREAKPOINT, EXCEPTION_ILLEGAL_INSTRUCTION,
        EXCEPTION_INT_DIVIDE_BY_ZERO, EXCEPTION_SINGLE_STEP, EXCEPTION_STACK_OVERFLOW, NTSTATUS,
    },
    System::Diagnostics::Debug::{AddVectoredExceptionHandler, EXCEPTION_POINTERS},
};

/// Name, base and size of the game executable, for module relative addresses
static MODULE: OnceLock<(String, usize, usize)> = OnceLock::new();

/// Thread naming exception raised by debuggers and some engines
const MS_VC_EXCEPTION: NTSTATUS = NTSTATUS(0x406D1388);
/// `throw` from MSVC C++ code, the game handles its own
const MSVC_CPP_EXCEPTION: NTSTATUS = NTSTATUS(0xE06D7363_u32 as i32);

fn describe_address(address: usize) -> String {
    match MODULE.get() {
        Some((name, base, size)) if (*base..base + size).contains(&address) => {
            format!("{name}+{:x}", address - base)
        }
        _ => format!("{address:#x}"),
    }
}

extern "system" fn vectored_exception_handler(exception_info: *mut EXCEPTION_POINTERS) -> i32 {
    unsafe {
        if !exception_info.is_null() {
            let exception_record = (*exception_info).ExceptionRecord;
            if !exception_record.is_null() {
                let exception_code = (*exception_record).ExceptionCode;
                let exception_address = (*exception_record).ExceptionAddress as usize;

                let exception_name = match exception_code {
                    EXCEPTION_ACCESS_VIOLATION => "ACCESS_VIOLATION",
                    EXCEPTION_ILLEGAL_INSTRUCTION => "ILLEGAL_INSTRUCTION",
                    EXCEPTION_INT_DIVIDE_BY_ZERO => "INTEGER_DIVIDE_BY_ZERO",
                    EXCEPTION_ARRAY_BOUNDS_EXCEEDED => "ARRAY_BOUNDS_EXCEEDED",
                    EXCEPTION_STACK_OVERFLOW => "STACK_OVERFLOW",
                    EXCEPTION_BREAKPOINT => "BREAKPOINT",
                    EXCEPTION_SINGLE_STEP => "SINGLE_STEP",
                    DBG_PRINTEXCEPTION_WIDE_C
                    | DBG_PRINTEXCEPTION_C
                    | MS_VC_EXCEPTION
                    | MSVC_CPP_EXCEPTION => {
                        return 0;
                    }
                    _ => "UNKNOWN_EXCEPTION",
                };

                tracing::error!("=== EXCEPTION ===");
                tracing::error!("Exception Code: 0x{:08X}", exception_code.0);
                tracing::error!(
                    "Exception Address: {}",
                    describe_address(exception_address)
                );
                tracing::error!("Exception Type: {}", exception_name);
            }
        }
    }

    // EXCEPTION_CONTINUE_SEARCH, the game's own handlers still run
    0
}

/// Log exceptions raised anywhere in the process with addresses relative to `module`
pub unsafe fn setup_windows_exception_handler(module: &fixkit_image::ModuleImage) {
    MODULE.get_or_init(|| (module.name().to_string(), module.base(), module.size()));

    let handle = AddVectoredExceptionHandler(1, Some(vectored_exception_handler));
    if handle.is_null() {
        tracing::warn!("Failed to install vectored exception handler");
    } else {
        tracing::info!("Vectored exception handler installed");
    }
}
