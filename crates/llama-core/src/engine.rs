//! The seam between the bridge and an inference engine.
//!
//! An [`Engine`] loads model files into [`Session`]s. A session is one live
//! inference context; it is driven by exactly one caller at a time, which
//! is why its methods take `&mut self` or are only reached through the
//! bridge's lock.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::chat::ChatMessage;
use crate::completion::Completion;
use crate::error::Result;
use crate::params::Params;

pub trait Engine: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Load `path` into a new session.
    ///
    /// `on_progress` receives loading percentages (0-100) on the calling
    /// thread before this returns. Any failure is a
    /// [`LlamaError::ModelLoadFailed`](crate::LlamaError::ModelLoadFailed).
    fn load(
        &self,
        path: &Path,
        params: &Params,
        on_progress: &mut dyn FnMut(u32),
    ) -> Result<Box<dyn Session>>;
}

pub trait Session: Send {
    /// Run one completion to its end, handing each generated fragment to
    /// `on_token` in order. Checks `cancel` between generated units.
    fn complete(
        &mut self,
        params: &Params,
        on_token: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Completion>;

    /// Render `messages` as a prompt. `template` of `None` selects the
    /// model's built-in template.
    fn format_chat(&self, messages: &[ChatMessage], template: Option<&str>) -> Result<String>;

    fn tokenize(&self, text: &str) -> Result<Vec<i32>>;

    fn detokenize(&self, tokens: &[i32]) -> Result<String>;

    fn details(&self) -> ModelDetails;
}

/// Descriptive information about a loaded model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelDetails {
    pub desc: String,
    pub size: u64,
    pub n_params: u64,
    pub n_ctx_train: u32,
    pub chat_template: Option<String>,
    pub metadata: BTreeMap<String, String>,
}
