//! [`Engine`] backed by llama.cpp through `llama-sys`.

mod backend;
mod context;
mod model;
mod sampler;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

pub use backend::system_info;
pub use context::ContextParams;
pub use model::ModelParams;

use self::context::{Batch, LlamaContext};
use self::model::LlamaModel;
use self::sampler::SamplerChain;
use crate::cancel::CancelToken;
use crate::chat::ChatMessage;
use crate::completion::{Completion, CompletionRequest, FinishReason, Generation};
use crate::engine::{Engine, ModelDetails, Session};
use crate::error::{LlamaError, Result};
use crate::params::Params;
use crate::probe::probe;

#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaEngine;

impl LlamaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for LlamaEngine {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn load(
        &self,
        path: &Path,
        params: &Params,
        on_progress: &mut dyn FnMut(u32),
    ) -> Result<Box<dyn Session>> {
        let model_params =
            ModelParams::from_params(params).map_err(|e| LlamaError::load(path, e.to_string()))?;
        let ctx_params =
            ContextParams::from_params(params).map_err(|e| LlamaError::load(path, e.to_string()))?;

        // Cheap rejection of files llama.cpp would choke on.
        let header = probe(path).map_err(|e| LlamaError::load(path, e.to_string()))?;
        debug!(
            arch = header.architecture().unwrap_or("?"),
            tensors = header.tensor_count,
            "GGUF header accepted"
        );

        backend::ensure_initialized();
        let model = Arc::new(LlamaModel::load(path, &model_params, on_progress)?);
        let ctx = LlamaContext::new(Arc::clone(&model), &ctx_params)
            .map_err(|e| LlamaError::load(path, e.to_string()))?;

        info!(
            desc = %model.desc(),
            n_ctx = ctx.n_ctx(),
            n_gpu_layers = model_params.n_gpu_layers,
            "Session ready"
        );
        Ok(Box::new(LlamaSession { ctx }))
    }
}

pub struct LlamaSession {
    ctx: LlamaContext,
}

impl LlamaSession {
    /// Feed the prompt through the decoder in `n_batch` chunks, leaving the
    /// last chunk in `batch` with logits requested for its final token.
    fn evaluate_prompt(&mut self, tokens: &[i32], batch: &mut Batch) -> Result<()> {
        let chunk = self.ctx.n_batch().max(1) as usize;
        for (c, part) in tokens.chunks(chunk).enumerate() {
            batch.clear();
            let base = c * chunk;
            for (i, &tok) in part.iter().enumerate() {
                let pos = base + i;
                batch.push(tok, pos as i32, pos == tokens.len() - 1);
            }
            self.ctx.decode(batch)?;
        }
        Ok(())
    }
}

impl Session for LlamaSession {
    fn complete(
        &mut self,
        params: &Params,
        on_token: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Completion> {
        let request = CompletionRequest::from_params(params)?;
        let prompt = self.ctx.model().tokenize(&request.prompt, true)?;
        let n_ctx = self.ctx.n_ctx() as usize;
        if prompt.is_empty() {
            return Err(LlamaError::InferenceFailed("prompt produced no tokens".into()));
        }
        if prompt.len() >= n_ctx {
            return Err(LlamaError::InferenceFailed(format!(
                "prompt of {} tokens exceeds context of {n_ctx}",
                prompt.len()
            )));
        }

        self.ctx.clear_memory();
        let mut batch = Batch::new(self.ctx.n_batch() as usize);

        let started = Instant::now();
        self.evaluate_prompt(&prompt, &mut batch)?;
        let prompt_ms = started.elapsed().as_secs_f64() * 1000.0;
        let prompt_n = prompt.len() as u32;

        let mut sampler = SamplerChain::from_params(&request.sampling);
        let mut generation = Generation::new(&request, on_token, cancel);
        let mut n_cur = prompt.len();
        // Bytes of a multi-byte character split across tokens.
        let mut pending: Vec<u8> = Vec::new();

        let reason = loop {
            if let Some(reason) = generation.check() {
                break reason;
            }
            if n_cur >= n_ctx {
                break FinishReason::Length;
            }

            let token = sampler.sample(&self.ctx, batch.last_index());
            if self.ctx.model().is_eog(token) {
                break FinishReason::Stop;
            }

            pending.extend_from_slice(&self.ctx.model().token_bytes(token));
            let ready = utf8_prefix_len(&pending);
            if ready == 0 {
                generation.push_silent();
            } else {
                let piece = String::from_utf8_lossy(&pending[..ready]).into_owned();
                pending.drain(..ready);
                if let Some(reason) = generation.push(&piece) {
                    break reason;
                }
            }

            batch.clear();
            batch.push(token, n_cur as i32, true);
            n_cur += 1;
            self.ctx.decode(&batch)?;
        };

        let reason = flush_pending(&mut generation, &pending, reason);
        let completion = generation.finish(reason, prompt_n, prompt_ms);
        debug!(
            predicted = completion.tokens_predicted,
            reason = %completion.finish_reason,
            tps = completion.timings.predicted_per_second(),
            "Completion finished"
        );
        Ok(completion)
    }

    fn format_chat(&self, messages: &[ChatMessage], template: Option<&str>) -> Result<String> {
        self.ctx.model().apply_chat_template(messages, template)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        self.ctx.model().tokenize(text, false)
    }

    fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        self.ctx.model().detokenize(tokens)
    }

    fn details(&self) -> ModelDetails {
        ModelDetails {
            desc: self.ctx.model().desc(),
            size: self.ctx.model().size(),
            n_params: self.ctx.model().n_params(),
            n_ctx_train: self.ctx.model().n_ctx_train().max(0) as u32,
            chat_template: self.ctx.model().chat_template(),
            metadata: self.ctx.model().metadata(),
        }
    }
}

/// Length of the longest prefix of `bytes` that cannot grow into a longer
/// valid character. Invalid bytes count as ready and are replaced on
/// conversion.
fn utf8_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => match e.error_len() {
            // incomplete sequence at the end
            None => e.valid_up_to(),
            Some(_) => bytes.len(),
        },
    }
}

/// Deliver bytes still waiting for a character to complete once the loop
/// has ended; an unfinished sequence becomes U+FFFD.
fn flush_pending(
    generation: &mut Generation<'_>,
    pending: &[u8],
    reason: FinishReason,
) -> FinishReason {
    if pending.is_empty() || matches!(reason, FinishReason::StopWord(_)) {
        return reason;
    }
    let tail = String::from_utf8_lossy(pending);
    generation.deliver(&tail).unwrap_or(reason)
}
