//! Engine-agnostic core of the llama bridge.
//!
//! Defines the [`Engine`]/[`Session`] seam, the loosely typed parameter maps
//! exchanged with host code, completion bookkeeping shared by every engine,
//! and a GGUF header probe. The llama.cpp engine lives behind the `native`
//! feature.

pub mod cancel;
pub mod chat;
pub mod completion;
pub mod engine;
pub mod error;
pub mod params;
pub mod probe;

#[cfg(feature = "native")]
pub mod native;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cancel::CancelToken;
pub use chat::{ChatMessage, parse_messages, resolve_template};
pub use completion::{
    Completion, CompletionRequest, FinishReason, Generation, SamplingParams, Timings,
};
pub use engine::{Engine, ModelDetails, Session};
pub use error::{ErrorKind, LlamaError, Result};
pub use params::{ParamError, ParamValue, Params};
pub use probe::{ModelProbe, ProbeError, probe};
