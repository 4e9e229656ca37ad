//! C ABI over [`ContextWrapper`] for Swift, Objective-C and Kotlin hosts.
//!
//! Parameter maps and results cross the boundary as JSON text. Strings
//! returned to the caller are owned by the caller and must be released with
//! [`llama_bridge_string_free`]. Failures are reported through an optional
//! [`LlamaBridgeError`] out-parameter whose message must be released with
//! [`llama_bridge_error_clear`].
//!
//! The matching declarations live in `include/llama_bridge.h`.

#![allow(clippy::missing_safety_doc)]

use std::any::Any;
use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, PoisonError, RwLock};

use llama_core::{Engine, ErrorKind, LlamaError, Params};
use thiserror::Error;
use tracing::error;

use crate::wrapper::ContextWrapper;

//  Error reporting

pub const LLAMA_BRIDGE_OK: i32 = 0;
pub const LLAMA_BRIDGE_ERR_LOAD: i32 = 1;
pub const LLAMA_BRIDGE_ERR_NOT_LOADED: i32 = 2;
pub const LLAMA_BRIDGE_ERR_INFERENCE: i32 = 3;
pub const LLAMA_BRIDGE_ERR_FORMAT: i32 = 4;
pub const LLAMA_BRIDGE_ERR_BUSY: i32 = 5;
pub const LLAMA_BRIDGE_ERR_INVALID_ARGUMENT: i32 = 6;
pub const LLAMA_BRIDGE_ERR_INTERNAL: i32 = 7;

/// Error out-parameter. `code` is 0 and `message` null on success.
#[repr(C)]
#[derive(Debug)]
pub struct LlamaBridgeError {
    pub code: i32,
    pub message: *mut c_char,
}

impl Default for LlamaBridgeError {
    fn default() -> Self {
        Self {
            code: LLAMA_BRIDGE_OK,
            message: ptr::null_mut(),
        }
    }
}

#[derive(Debug, Error)]
enum CallError {
    #[error(transparent)]
    Llama(#[from] LlamaError),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("internal error: {0}")]
    Panic(String),
}

impl CallError {
    fn code(&self) -> i32 {
        match self {
            Self::Llama(e) => match e.kind() {
                ErrorKind::Load => LLAMA_BRIDGE_ERR_LOAD,
                ErrorKind::NotLoaded => LLAMA_BRIDGE_ERR_NOT_LOADED,
                ErrorKind::Inference => LLAMA_BRIDGE_ERR_INFERENCE,
                ErrorKind::Format => LLAMA_BRIDGE_ERR_FORMAT,
                ErrorKind::Busy => LLAMA_BRIDGE_ERR_BUSY,
            },
            Self::InvalidArgument(_) => LLAMA_BRIDGE_ERR_INVALID_ARGUMENT,
            Self::Panic(_) => LLAMA_BRIDGE_ERR_INTERNAL,
        }
    }
}

/// Run `f`, converting a failure or a panic into `out` and `fallback`.
fn guarded<T>(
    out: *mut LlamaBridgeError,
    fallback: T,
    f: impl FnOnce() -> Result<T, CallError>,
) -> T {
    let result = catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(CallError::Panic(panic_message(&*payload))));
    match result {
        Ok(value) => {
            write_error(out, LLAMA_BRIDGE_OK, None);
            value
        }
        Err(e) => {
            if let CallError::Panic(msg) = &e {
                error!(panic = %msg, "Panic caught at the C boundary");
            }
            write_error(out, e.code(), Some(&e.to_string()));
            fallback
        }
    }
}

fn write_error(out: *mut LlamaBridgeError, code: i32, message: Option<&str>) {
    if out.is_null() {
        return;
    }
    // Safety: caller promises `out` points to a writable LlamaBridgeError.
    let out = unsafe { &mut *out };
    free_message(out);
    out.code = code;
    out.message = message.map_or(ptr::null_mut(), to_c_string);
}

fn free_message(err: &mut LlamaBridgeError) {
    if !err.message.is_null() {
        drop(unsafe { CString::from_raw(err.message) });
        err.message = ptr::null_mut();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

//  Strings

fn to_c_string(s: &str) -> *mut c_char {
    let bytes: Vec<u8> = s.bytes().filter(|&b| b != 0).collect();
    CString::new(bytes).unwrap_or_default().into_raw()
}

/// Borrow a required UTF-8 string argument.
unsafe fn arg_str<'a>(p: *const c_char, name: &'static str) -> Result<&'a str, CallError> {
    if p.is_null() {
        return Err(CallError::InvalidArgument(name));
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| CallError::InvalidArgument(name))
}

/// Borrow an optional UTF-8 string argument; null means absent.
unsafe fn arg_opt_str<'a>(
    p: *const c_char,
    name: &'static str,
) -> Result<Option<&'a str>, CallError> {
    if p.is_null() {
        Ok(None)
    } else {
        unsafe { arg_str(p, name) }.map(Some)
    }
}

//  Engine selection

static INSTALLED_ENGINE: RwLock<Option<Arc<dyn Engine>>> = RwLock::new(None);

/// Make `engine` the one used by [`llama_bridge_context_init`], replacing
/// any previously installed engine. Contexts already created keep theirs.
pub fn install_engine(engine: Arc<dyn Engine>) {
    *INSTALLED_ENGINE
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(engine);
}

fn resolve_engine() -> Option<Arc<dyn Engine>> {
    INSTALLED_ENGINE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .or_else(crate::default_engine)
}

//  Handles

/// Opaque context handle.
pub struct LlamaBridgeContext {
    inner: ContextWrapper,
}

unsafe fn context<'a>(ctx: *const LlamaBridgeContext) -> Result<&'a ContextWrapper, CallError> {
    if ctx.is_null() {
        return Err(CallError::InvalidArgument("ctx"));
    }
    Ok(unsafe { &(*ctx).inner })
}

pub type LlamaBridgeProgressCallback =
    Option<unsafe extern "C" fn(progress: u32, user_data: *mut c_void)>;

/// `token` is NUL-terminated and valid only for the duration of the call.
pub type LlamaBridgeTokenCallback =
    Option<unsafe extern "C" fn(token: *const c_char, user_data: *mut c_void)>;

//  Context lifecycle

/// Load a model. Returns null on failure.
///
/// `params_json` is a JSON object of model parameters, or null for none.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_init(
    model_path: *const c_char,
    params_json: *const c_char,
    on_progress: LlamaBridgeProgressCallback,
    user_data: *mut c_void,
    error: *mut LlamaBridgeError,
) -> *mut LlamaBridgeContext {
    guarded(error, ptr::null_mut(), || {
        let path = unsafe { arg_str(model_path, "model_path") }?;
        let params = match unsafe { arg_opt_str(params_json, "params_json") }? {
            Some(json) => Params::from_json(json).map_err(|e| {
                LlamaError::load(Path::new(path), format!("invalid params JSON: {e}"))
            })?,
            None => Params::new(),
        };
        let engine = resolve_engine()
            .ok_or_else(|| LlamaError::load(Path::new(path), "no inference engine available"))?;

        let mut relay = |p: u32| {
            if let Some(cb) = on_progress {
                unsafe { cb(p, user_data) }
            }
        };
        let inner = ContextWrapper::initialize(engine.as_ref(), path, &params, Some(&mut relay))?;
        Ok(Box::into_raw(Box::new(LlamaBridgeContext { inner })))
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_is_loaded(ctx: *const LlamaBridgeContext) -> bool {
    guarded(ptr::null_mut(), false, || {
        Ok(unsafe { context(ctx) }?.is_loaded())
    })
}

/// Release the model. The handle stays valid until freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_invalidate(ctx: *const LlamaBridgeContext) {
    guarded(ptr::null_mut(), (), || {
        unsafe { context(ctx) }?.invalidate();
        Ok(())
    })
}

/// Invalidate and free the handle. Null is ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_free(ctx: *mut LlamaBridgeContext) {
    if ctx.is_null() {
        return;
    }
    guarded(ptr::null_mut(), (), || {
        drop(unsafe { Box::from_raw(ctx) });
        Ok(())
    })
}

//  Inference

/// Run a completion. Returns the result map as a JSON string, or null on
/// failure. May be stopped from another thread with
/// [`llama_bridge_context_stop_completion`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_completion(
    ctx: *const LlamaBridgeContext,
    params_json: *const c_char,
    on_token: LlamaBridgeTokenCallback,
    user_data: *mut c_void,
    error: *mut LlamaBridgeError,
) -> *mut c_char {
    guarded(error, ptr::null_mut(), || {
        let ctx = unsafe { context(ctx) }?;
        let json = unsafe { arg_str(params_json, "params_json") }?;
        if !ctx.is_loaded() {
            return Err(LlamaError::ModelNotLoaded.into());
        }
        let params = Params::from_json(json)
            .map_err(|e| LlamaError::InferenceFailed(format!("invalid params JSON: {e}")))?;

        let mut relay = |piece: &str| {
            if let Some(cb) = on_token {
                let c = to_c_string(piece);
                unsafe {
                    cb(c, user_data);
                    drop(CString::from_raw(c));
                }
            }
        };
        let completion = ctx.complete(&params, Some(&mut relay))?;
        let json = completion
            .to_params()
            .to_json()
            .map_err(|e| LlamaError::InferenceFailed(format!("result encoding: {e}")))?;
        Ok(to_c_string(&json))
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_stop_completion(ctx: *const LlamaBridgeContext) {
    guarded(ptr::null_mut(), (), || {
        unsafe { context(ctx) }?.stop_completion();
        Ok(())
    })
}

/// Render a JSON message array into a prompt. A null or blank
/// `chat_template` selects the model's own template.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_format_chat(
    ctx: *const LlamaBridgeContext,
    messages_json: *const c_char,
    chat_template: *const c_char,
    error: *mut LlamaBridgeError,
) -> *mut c_char {
    guarded(error, ptr::null_mut(), || {
        let ctx = unsafe { context(ctx) }?;
        let messages = unsafe { arg_str(messages_json, "messages_json") }?;
        let template = unsafe { arg_opt_str(chat_template, "chat_template") }?;
        let prompt = ctx.format_chat(messages, template)?;
        Ok(to_c_string(&prompt))
    })
}

/// Model description and metadata as a JSON object, or null on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_context_model_details(
    ctx: *const LlamaBridgeContext,
    error: *mut LlamaBridgeError,
) -> *mut c_char {
    guarded(error, ptr::null_mut(), || {
        let details = unsafe { context(ctx) }?.model_details()?;
        let json = serde_json::to_string(&details)
            .map_err(|e| LlamaError::InferenceFailed(format!("details encoding: {e}")))?;
        Ok(to_c_string(&json))
    })
}

//  Memory

#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

/// Free the message of `error` and reset it to success.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn llama_bridge_error_clear(error: *mut LlamaBridgeError) {
    if error.is_null() {
        return;
    }
    let err = unsafe { &mut *error };
    free_message(err);
    err.code = LLAMA_BRIDGE_OK;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_error_kinds() {
        let cases = [
            (CallError::from(LlamaError::load(Path::new("m"), "x")), 1),
            (CallError::from(LlamaError::ModelNotLoaded), 2),
            (CallError::from(LlamaError::InferenceFailed("x".into())), 3),
            (CallError::from(LlamaError::TokenizationFailed("x".into())), 3),
            (CallError::from(LlamaError::FormatFailed("x".into())), 4),
            (CallError::from(LlamaError::Busy), 5),
            (CallError::InvalidArgument("ctx"), 6),
            (CallError::Panic("boom".into()), 7),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[test]
    fn panics_become_internal_errors() {
        let mut err = LlamaBridgeError::default();
        let value = guarded(&mut err, -1, || -> Result<i32, CallError> { panic!("kaboom") });
        assert_eq!(value, -1);
        assert_eq!(err.code, LLAMA_BRIDGE_ERR_INTERNAL);
        let msg = unsafe { CStr::from_ptr(err.message) }.to_str().unwrap();
        assert!(msg.contains("kaboom"));
        unsafe { llama_bridge_error_clear(&mut err) };
        assert!(err.message.is_null());
        assert_eq!(err.code, LLAMA_BRIDGE_OK);
    }

    #[test]
    fn interior_nul_is_dropped() {
        let p = to_c_string("a\0b");
        let s = unsafe { CStr::from_ptr(p) }.to_str().unwrap().to_owned();
        unsafe { llama_bridge_string_free(p) };
        assert_eq!(s, "ab");
    }

    #[test]
    fn null_handles_are_rejected() {
        let mut err = LlamaBridgeError::default();
        let out = unsafe {
            llama_bridge_context_format_chat(ptr::null(), c"[]".as_ptr(), ptr::null(), &mut err)
        };
        assert!(out.is_null());
        assert_eq!(err.code, LLAMA_BRIDGE_ERR_INVALID_ARGUMENT);
        unsafe { llama_bridge_error_clear(&mut err) };

        assert!(!unsafe { llama_bridge_context_is_loaded(ptr::null()) });
        unsafe {
            llama_bridge_context_stop_completion(ptr::null());
            llama_bridge_context_invalidate(ptr::null());
            llama_bridge_context_free(ptr::null_mut());
            llama_bridge_string_free(ptr::null_mut());
        }
    }
}
