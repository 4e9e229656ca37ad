//! Test doubles: a deterministic [`Engine`] and a GGUF fixture writer.
//!
//! Enabled for this crate's own tests and, through the `testing` feature,
//! for downstream crates that need an engine without real model weights.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::chat::ChatMessage;
use crate::completion::{Completion, CompletionRequest, FinishReason, Generation};
use crate::engine::{Engine, ModelDetails, Session};
use crate::error::{LlamaError, Result};
use crate::params::Params;
use crate::probe::{GGUF_MAGIC, ModelProbe, probe};

/// Template used when neither the caller nor the model file supplies one.
pub const DEFAULT_TEMPLATE: &str = "<|{role}|>\n{content}\n";

//  GGUF fixtures

/// Builds minimal GGUF files: header plus metadata, no tensors.
#[derive(Debug, Clone, Default)]
pub struct GgufWriter {
    entries: Vec<u8>,
    count: u64,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, key: &str, tag: u32) {
        put_str(&mut self.entries, key);
        self.entries.extend_from_slice(&tag.to_le_bytes());
        self.count += 1;
    }

    pub fn string(mut self, key: &str, value: &str) -> Self {
        self.key(key, 8);
        put_str(&mut self.entries, value);
        self
    }

    pub fn uint32(mut self, key: &str, value: u32) -> Self {
        self.key(key, 4);
        self.entries.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn float32(mut self, key: &str, value: f32) -> Self {
        self.key(key, 6);
        self.entries.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bool(mut self, key: &str, value: bool) -> Self {
        self.key(key, 7);
        self.entries.push(u8::from(value));
        self
    }

    pub fn string_array(mut self, key: &str, values: &[&str]) -> Self {
        self.key(key, 9);
        self.entries.extend_from_slice(&8u32.to_le_bytes());
        self.entries
            .extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            put_str(&mut self.entries, v);
        }
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.entries.len());
        out.extend_from_slice(&GGUF_MAGIC);
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.entries);
        out
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_bytes())
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Write `<dir>/<name>.gguf` describing a small llama model whose built-in
/// chat template is [`DEFAULT_TEMPLATE`].
pub fn write_model_fixture(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("{name}.gguf"));
    GgufWriter::new()
        .string("general.architecture", "llama")
        .string("general.name", name)
        .uint32("llama.context_length", 256)
        .string("tokenizer.chat_template", DEFAULT_TEMPLATE)
        .string_array("tokenizer.ggml.tokens", &["<s>", "</s>"])
        .write_to(&path)?;
    Ok(path)
}

//  Scripted engine

/// Engine that "generates" a fixed reply, one word per token.
///
/// Loading accepts any file the GGUF probe accepts. The recognised model
/// parameter is `n_ctx`; completion parameters are read like the native
/// engine reads them.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    reply: String,
    progress: Vec<u32>,
    fail_after: Option<usize>,
    token_delay: Option<Duration>,
    loads: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            progress: vec![0, 50, 100],
            fail_after: None,
            token_delay: None,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_progress(mut self, steps: Vec<u32>) -> Self {
        self.progress = steps;
        self
    }

    /// Fail with an inference error once `n` tokens have been produced.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep before each token, to keep a completion in flight.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Successful loads so far, across clones.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load(
        &self,
        path: &Path,
        params: &Params,
        on_progress: &mut dyn FnMut(u32),
    ) -> Result<Box<dyn Session>> {
        let probe = probe(path).map_err(|e| LlamaError::load(path, e.to_string()))?;
        let n_ctx = params
            .get_u32("n_ctx")
            .map_err(|e| LlamaError::load(path, e.to_string()))?
            .filter(|&n| n > 0)
            .or(probe.context_length())
            .unwrap_or(512);

        for &step in &self.progress {
            on_progress(step);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedSession {
            probe,
            n_ctx,
            reply: self.reply.clone(),
            fail_after: self.fail_after,
            token_delay: self.token_delay,
        }))
    }
}

struct ScriptedSession {
    probe: ModelProbe,
    n_ctx: u32,
    reply: String,
    fail_after: Option<usize>,
    token_delay: Option<Duration>,
}

impl Session for ScriptedSession {
    fn complete(
        &mut self,
        params: &Params,
        on_token: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Completion> {
        let request = CompletionRequest::from_params(params)?;
        let prompt_n = request.prompt.split_whitespace().count() as u32;
        if prompt_n >= self.n_ctx {
            return Err(LlamaError::InferenceFailed(format!(
                "prompt of {prompt_n} tokens exceeds context of {}",
                self.n_ctx
            )));
        }

        let mut pieces = self.reply.split_inclusive(' ');
        let mut produced = 0usize;
        let mut generation = Generation::new(&request, on_token, cancel);

        let reason = loop {
            if let Some(reason) = generation.check() {
                break reason;
            }
            if self.fail_after == Some(produced) {
                return Err(LlamaError::InferenceFailed(format!(
                    "scripted failure after {produced} tokens"
                )));
            }
            if prompt_n + produced as u32 >= self.n_ctx {
                break FinishReason::Length;
            }
            let Some(piece) = pieces.next() else {
                break FinishReason::Stop;
            };
            if let Some(delay) = self.token_delay {
                std::thread::sleep(delay);
            }
            produced += 1;
            if let Some(reason) = generation.push(piece) {
                break reason;
            }
        };

        Ok(generation.finish(reason, prompt_n, 0.0))
    }

    fn format_chat(&self, messages: &[ChatMessage], template: Option<&str>) -> Result<String> {
        let template = template
            .or(self.probe.chat_template())
            .unwrap_or(DEFAULT_TEMPLATE);
        let mut out = String::new();
        for m in messages {
            out.push_str(&render(template, m)?);
        }
        out.push_str(&render(template, &ChatMessage::new("assistant", ""))?);
        Ok(out)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        Ok(text.chars().map(|c| c as i32).collect())
    }

    fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        tokens
            .iter()
            .map(|&t| {
                u32::try_from(t)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| LlamaError::TokenizationFailed(format!("unknown token {t}")))
            })
            .collect()
    }

    fn details(&self) -> ModelDetails {
        ModelDetails {
            desc: self
                .probe
                .name()
                .or(self.probe.architecture())
                .unwrap_or("unknown")
                .to_owned(),
            size: self.probe.file_size,
            n_params: 0,
            n_ctx_train: self.probe.context_length().unwrap_or(0),
            chat_template: self.probe.chat_template().map(str::to_owned),
            metadata: self.probe.metadata.clone(),
        }
    }
}

/// Substitute `{role}` and `{content}`; any other `{name}` is an error.
fn render(template: &str, message: &ChatMessage) -> Result<String> {
    let mut out = String::with_capacity(template.len() + message.content.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| LlamaError::FormatFailed("unterminated '{' in template".into()))?;
        match &after[..close] {
            "role" => out.push_str(&message.role),
            "content" => out.push_str(&message.content),
            other => {
                return Err(LlamaError::FormatFailed(format!(
                    "template references undefined field '{other}'"
                )));
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
