//! The stateful adapter around one loaded context.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use llama_core::{
    CancelToken, ChatMessage, Completion, Engine, LlamaError, ModelDetails, Params, Result,
    Session, parse_messages, resolve_template,
};
use tracing::{debug, info, warn};

/// Owns at most one engine session and serialises access to it.
///
/// A value only exists after a successful [`initialize`](Self::initialize).
/// Operations that touch the session fail with
/// [`LlamaError::ModelNotLoaded`] once [`invalidate`](Self::invalidate) has
/// run, and with [`LlamaError::Busy`] while another such call is in flight.
///
/// Callbacks run on the calling thread while the session lock is held; they
/// must not call back into the same adapter except for
/// [`stop_completion`](Self::stop_completion) and
/// [`is_loaded`](Self::is_loaded).
pub struct ContextWrapper {
    session: Mutex<Option<Box<dyn Session>>>,
    loaded: AtomicBool,
    cancel: CancelToken,
    model_path: PathBuf,
    engine: String,
}

impl ContextWrapper {
    /// Load `model_path` with `engine`, relaying loading progress (0-100)
    /// to `on_progress` before returning.
    ///
    /// `params` reaches the engine untouched.
    pub fn initialize(
        engine: &dyn Engine,
        model_path: impl AsRef<Path>,
        params: &Params,
        on_progress: Option<&mut dyn FnMut(u32)>,
    ) -> Result<Self> {
        let path = model_path.as_ref();
        check_model_file(path)?;

        info!(path = %path.display(), engine = engine.name(), "Initializing context");
        let mut ignore = |_: u32| {};
        let on_progress: &mut dyn FnMut(u32) = match on_progress {
            Some(f) => f,
            None => &mut ignore,
        };

        let session = engine.load(path, params, on_progress).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "Model load failed");
        })?;

        info!(path = %path.display(), "Context ready");
        Ok(Self {
            session: Mutex::new(Some(session)),
            loaded: AtomicBool::new(true),
            cancel: CancelToken::new(),
            model_path: path.to_path_buf(),
            engine: engine.name().to_owned(),
        })
    }

    /// Whether a live session is held. Never blocks.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn engine_name(&self) -> &str {
        &self.engine
    }

    /// Run one completion. Every fragment reaches `on_token` in order
    /// before this returns, and the returned text is their concatenation.
    pub fn complete(
        &self,
        params: &Params,
        on_token: Option<&mut dyn FnMut(&str)>,
    ) -> Result<Completion> {
        let mut guard = self.acquire("complete")?;
        self.cancel.reset();
        // An invalidate that raced in before the reset must still win.
        if !self.is_loaded() {
            return Err(LlamaError::ModelNotLoaded);
        }
        let session = guard.as_mut().ok_or(LlamaError::ModelNotLoaded)?;

        let mut ignore = |_: &str| {};
        let on_token: &mut dyn FnMut(&str) = match on_token {
            Some(f) => f,
            None => &mut ignore,
        };

        let completion = session.complete(params, on_token, &self.cancel)?;
        debug!(
            tokens = completion.tokens_predicted,
            fragments = completion.fragments,
            reason = %completion.finish_reason,
            "Completion returned"
        );
        Ok(completion)
    }

    /// Ask the running completion, if any, to stop after the current unit.
    /// The completion then returns normally with a `cancelled` reason.
    pub fn stop_completion(&self) {
        if self.is_loaded() {
            debug!("Stop requested");
            self.cancel.cancel();
        }
    }

    /// Render a JSON array of `{role, content}` messages into a prompt.
    ///
    /// A blank `chat_template` means the model's own template.
    pub fn format_chat(&self, messages_json: &str, chat_template: Option<&str>) -> Result<String> {
        if !self.is_loaded() {
            return Err(LlamaError::ModelNotLoaded);
        }
        let messages = parse_messages(messages_json)?;
        self.format_messages(&messages, chat_template)
    }

    pub fn format_messages(
        &self,
        messages: &[ChatMessage],
        chat_template: Option<&str>,
    ) -> Result<String> {
        let guard = self.acquire("format_chat")?;
        let session = guard.as_ref().ok_or(LlamaError::ModelNotLoaded)?;
        session
            .format_chat(messages, resolve_template(chat_template))
            .map_err(|e| match e {
                LlamaError::FormatFailed(_) => e,
                other => LlamaError::FormatFailed(other.to_string()),
            })
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        let guard = self.acquire("tokenize")?;
        guard
            .as_ref()
            .ok_or(LlamaError::ModelNotLoaded)?
            .tokenize(text)
    }

    pub fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        let guard = self.acquire("detokenize")?;
        guard
            .as_ref()
            .ok_or(LlamaError::ModelNotLoaded)?
            .detokenize(tokens)
    }

    pub fn model_details(&self) -> Result<ModelDetails> {
        let guard = self.acquire("model_details")?;
        Ok(guard.as_ref().ok_or(LlamaError::ModelNotLoaded)?.details())
    }

    /// Cancel any running completion, wait for it, and release the session.
    /// Safe to call any number of times.
    pub fn invalidate(&self) {
        let was_loaded = self.loaded.swap(false, Ordering::SeqCst);
        self.cancel.cancel();

        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            drop(session);
            info!(path = %self.model_path.display(), "Context released");
        } else if was_loaded {
            debug!("Context already released");
        }
    }

    fn acquire(&self, op: &str) -> Result<MutexGuard<'_, Option<Box<dyn Session>>>> {
        if !self.is_loaded() {
            return Err(LlamaError::ModelNotLoaded);
        }
        match self.session.try_lock() {
            Ok(guard) => Ok(guard),
            // A panicking callback leaves the session itself intact.
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => {
                warn!(op, "Rejected: another call is in flight");
                Err(LlamaError::Busy)
            }
        }
    }
}

impl Drop for ContextWrapper {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for ContextWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWrapper")
            .field("model_path", &self.model_path)
            .field("engine", &self.engine)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn check_model_file(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| LlamaError::load(path, e.to_string()))?;
    if !meta.is_file() {
        return Err(LlamaError::load(path, "not a regular file"));
    }
    std::fs::File::open(path).map_err(|e| LlamaError::load(path, e.to_string()))?;
    Ok(())
}
