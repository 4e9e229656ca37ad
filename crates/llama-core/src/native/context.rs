//! Inference context and token batches.

use std::sync::Arc;

use tracing::debug;

use super::model::LlamaModel;
use crate::error::{LlamaError, Result};
use crate::params::{ParamError, Params};

/// Context options recognised in the initialisation map.
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// 0 selects the model's training context size.
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub embeddings: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(4);
        Self {
            n_ctx: 0,
            n_batch: 2048,
            n_ubatch: 512,
            n_threads: threads,
            n_threads_batch: threads,
            embeddings: false,
        }
    }
}

impl ContextParams {
    pub fn from_params(params: &Params) -> std::result::Result<Self, ParamError> {
        let d = Self::default();
        let n_threads = params.get_i32("n_threads")?.unwrap_or(d.n_threads);
        Ok(Self {
            n_ctx: params.get_u32("n_ctx")?.unwrap_or(d.n_ctx),
            n_batch: params.get_u32("n_batch")?.unwrap_or(d.n_batch),
            n_ubatch: params.get_u32("n_ubatch")?.unwrap_or(d.n_ubatch),
            n_threads,
            n_threads_batch: params.get_i32("n_threads_batch")?.unwrap_or(n_threads),
            embeddings: params.get_bool("embedding")?.unwrap_or(d.embeddings),
        })
    }
}

/// Owns a `llama_context` and keeps its model alive.
pub struct LlamaContext {
    ptr: *mut llama_sys::llama_context,
    model: Arc<LlamaModel>,
}

// Safety: a context is only touched through `&mut self`, and the bridge
// serialises every session call.
unsafe impl Send for LlamaContext {}

impl LlamaContext {
    pub fn new(model: Arc<LlamaModel>, params: &ContextParams) -> Result<Self> {
        let mut raw = unsafe { llama_sys::llama_context_default_params() };
        raw.n_ctx = params.n_ctx;
        raw.n_batch = params.n_batch;
        raw.n_ubatch = params.n_ubatch;
        raw.n_threads = params.n_threads;
        raw.n_threads_batch = params.n_threads_batch;
        raw.embeddings = params.embeddings;

        let ctx = unsafe { llama_sys::llama_init_from_model(model.as_ptr(), raw) };
        if ctx.is_null() {
            return Err(LlamaError::InferenceFailed(
                "llama_init_from_model returned null".into(),
            ));
        }

        let this = Self { ptr: ctx, model };
        debug!(n_ctx = this.n_ctx(), n_batch = this.n_batch(), "Context created");
        Ok(this)
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_context {
        self.ptr
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    pub fn n_ctx(&self) -> u32 {
        unsafe { llama_sys::llama_n_ctx(self.ptr) }
    }

    pub fn n_batch(&self) -> u32 {
        unsafe { llama_sys::llama_n_batch(self.ptr) }
    }

    pub fn decode(&mut self, batch: &Batch) -> Result<()> {
        let rc = unsafe { llama_sys::llama_decode(self.ptr, batch.inner) };
        match rc {
            0 => Ok(()),
            1 => Err(LlamaError::InferenceFailed(
                "no KV cache slot available for batch".into(),
            )),
            rc => Err(LlamaError::InferenceFailed(format!(
                "llama_decode failed with code {rc}"
            ))),
        }
    }

    /// Forget every cached position; each completion starts from scratch.
    pub fn clear_memory(&mut self) {
        unsafe {
            let mem = llama_sys::llama_get_memory(self.ptr);
            if !mem.is_null() {
                llama_sys::llama_memory_clear(mem, false);
            }
        }
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama context");
            unsafe { llama_sys::llama_free(self.ptr) }
        }
    }
}

/// Single-sequence token batch.
pub struct Batch {
    inner: llama_sys::llama_batch,
    capacity: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let inner = unsafe { llama_sys::llama_batch_init(capacity as i32, 0, 1) };
        Self { inner, capacity }
    }

    fn len(&self) -> usize {
        self.inner.n_tokens as usize
    }

    pub fn clear(&mut self) {
        self.inner.n_tokens = 0;
    }

    /// Append `token` at position `pos` of sequence 0. Returns `false` when
    /// the batch is already full.
    pub fn push(&mut self, token: i32, pos: i32, logits: bool) -> bool {
        let i = self.len();
        if i >= self.capacity {
            return false;
        }
        unsafe {
            *self.inner.token.add(i) = token;
            *self.inner.pos.add(i) = pos;
            *self.inner.n_seq_id.add(i) = 1;
            *(*self.inner.seq_id.add(i)) = 0;
            *self.inner.logits.add(i) = i8::from(logits);
        }
        self.inner.n_tokens += 1;
        true
    }

    /// Index of the last token, where sampling reads logits from.
    pub fn last_index(&self) -> i32 {
        self.inner.n_tokens - 1
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        unsafe { llama_sys::llama_batch_free(self.inner) }
    }
}
