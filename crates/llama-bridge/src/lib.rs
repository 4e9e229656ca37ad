//! Bridge adapter between host application code and one llama.cpp
//! inference context.
//!
//! [`ContextWrapper`] owns the context handle and forwards opaque
//! [`Params`] maps to the engine. [`stream`] runs completions on tokio's
//! blocking pool; [`ffi`] exposes the adapter over a C ABI for Swift,
//! Objective-C and Kotlin hosts.

pub mod ffi;
pub mod stream;
mod wrapper;

use std::sync::Arc;

pub use llama_core::{
    CancelToken, ChatMessage, Completion, Engine, ErrorKind, FinishReason, LlamaError,
    ModelDetails, ParamValue, Params, Result, Session,
};
pub use stream::{CompletionEvent, spawn_completion};
pub use wrapper::ContextWrapper;

/// The engine compiled into this build, if any.
pub fn default_engine() -> Option<Arc<dyn Engine>> {
    #[cfg(feature = "native")]
    {
        Some(Arc::new(llama_core::native::LlamaEngine::new()))
    }
    #[cfg(not(feature = "native"))]
    {
        None
    }
}
