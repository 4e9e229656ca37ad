//! Raw FFI bindings to the llama.cpp C API.
//!
//! The bindings are generated by `build.rs`. When llama.cpp can be found
//! neither as a prebuilt tree nor as sources the crate is empty and
//! [`BINDINGS_AVAILABLE`] is `false`.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

#[cfg(llama_bindings)]
include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// `true` when this build links against llama.cpp.
pub const BINDINGS_AVAILABLE: bool = cfg!(llama_bindings);
