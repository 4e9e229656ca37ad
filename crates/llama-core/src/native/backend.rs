//! Process-global llama.cpp backend.

use std::ffi::CStr;
use std::sync::Once;

use tracing::{debug, info};

static BACKEND_INIT: Once = Once::new();

/// Initialise llama.cpp and route its logging into `tracing`.
///
/// Idempotent; the backend lives until process exit.
pub fn ensure_initialized() {
    BACKEND_INIT.call_once(|| {
        unsafe {
            llama_sys::llama_backend_init();
            llama_sys::llama_log_set(Some(forward_log), std::ptr::null_mut());
        }
        info!("llama.cpp backend initialized");
        debug!(system = %system_info(), "llama.cpp system info");
    });
}

unsafe extern "C" fn forward_log(
    level: llama_sys::ggml_log_level,
    text: *const std::ffi::c_char,
    _user_data: *mut std::ffi::c_void,
) {
    if text.is_null() {
        return;
    }
    let msg = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    let msg = msg.trim();
    if msg.is_empty() {
        return;
    }
    // ggml_log_level: DEBUG=1, INFO=2, WARN=3, ERROR=4
    match level {
        4 => tracing::error!(target: "llama.cpp", "{msg}"),
        3 => tracing::warn!(target: "llama.cpp", "{msg}"),
        2 => tracing::info!(target: "llama.cpp", "{msg}"),
        _ => tracing::debug!(target: "llama.cpp", "{msg}"),
    }
}

pub fn system_info() -> String {
    unsafe {
        CStr::from_ptr(llama_sys::llama_print_system_info())
            .to_string_lossy()
            .into_owned()
    }
}
