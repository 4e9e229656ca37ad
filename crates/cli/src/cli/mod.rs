pub mod chat;
pub mod complete;
pub mod config_cmd;
pub mod format;
pub mod info;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use llama_bridge::{Completion, ContextWrapper, ParamValue, Params};
use tracing::info;

use crate::config::{AppConfig, parse_assignment};

#[derive(Parser)]
#[command(
    name = "llama-bridge",
    version,
    about = "Drive a llama.cpp context through the bridge adapter"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// Model parameter passed to the engine at load time (repeatable).
    #[arg(long = "model-param", value_name = "KEY=VALUE", value_parser = parse_assignment, global = true)]
    pub model_params: Vec<(String, ParamValue)>,

    /// Context size; shorthand for --model-param n_ctx=N.
    #[arg(long, env = "LLAMA_CTX_SIZE", global = true)]
    pub ctx_size: Option<u32>,

    /// GPU layers (-1 = all, 0 = CPU only).
    #[arg(long, env = "LLAMA_N_GPU_LAYERS", global = true)]
    pub n_gpu_layers: Option<i32>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show GGUF header metadata without loading the model.
    Info {
        /// Path to the GGUF file.
        model: PathBuf,
    },

    /// Run one completion and stream it to stdout.
    Complete(CompleteArgs),

    /// Interactive chat using the model's chat template.
    Chat(ChatArgs),

    /// Render a message list with the chat template.
    Format(FormatArgs),

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
pub struct CompleteArgs {
    /// GGUF model (defaults to the configured default_model).
    pub model: Option<PathBuf>,

    /// Prompt text.
    #[arg(short, long)]
    pub prompt: String,

    /// Completion parameter (repeatable), e.g. --param n_predict=64.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub params: Vec<(String, ParamValue)>,

    /// Print the result map as JSON instead of the bare text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct ChatArgs {
    /// GGUF model (defaults to the configured default_model).
    pub model: Option<PathBuf>,

    /// System prompt.
    #[arg(long)]
    pub system: Option<String>,

    /// Chat template overriding the model's own.
    #[arg(long)]
    pub template: Option<String>,

    /// Completion parameter (repeatable).
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub params: Vec<(String, ParamValue)>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct FormatArgs {
    /// GGUF model (defaults to the configured default_model).
    pub model: Option<PathBuf>,

    /// JSON array of {role, content} messages; `-` reads stdin.
    #[arg(long)]
    pub messages: String,

    /// Chat template overriding the model's own.
    #[arg(long)]
    pub template: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value: default_model, model.<param> or
    /// completion.<param>. Values are parsed as JSON when possible.
    Set { key: String, value: String },
}

//  Shared helpers

/// Model parameters: configured defaults, then command-line overrides.
pub fn model_params(cfg: &AppConfig, global: &GlobalArgs) -> Params {
    let mut params = cfg.model_params.clone();
    if let Some(n) = global.ctx_size {
        params.insert("n_ctx", n);
    }
    if let Some(n) = global.n_gpu_layers {
        params.insert("n_gpu_layers", n);
    }
    for (k, v) in &global.model_params {
        params.insert(k.as_str(), v.clone());
    }
    params
}

/// Completion parameters: configured defaults, then `overrides`.
pub fn completion_params(cfg: &AppConfig, overrides: &[(String, ParamValue)]) -> Params {
    let overrides: Params = overrides.iter().cloned().collect();
    let mut params = cfg.completion_params.clone();
    params.merge(&overrides);
    params
}

/// Load `model` with the engine compiled into this binary, drawing a
/// progress line on stderr.
pub fn load_context(model: PathBuf, params: Params) -> anyhow::Result<Arc<ContextWrapper>> {
    let engine = llama_bridge::default_engine().context(
        "this binary was built without an inference engine; rebuild with --features native",
    )?;

    info!(model = %model.display(), "Loading model…");
    let ctx = tokio::task::block_in_place(|| {
        let mut on_progress = |pct: u32| {
            eprint!("\rLoading {}: {pct:>3}%", model.display());
            let _ = std::io::stderr().flush();
        };
        ContextWrapper::initialize(engine.as_ref(), &model, &params, Some(&mut on_progress))
    });
    eprintln!();
    Ok(Arc::new(ctx?))
}

pub fn print_stats(c: &Completion) {
    eprintln!(
        "  [{} | prompt: {} tok, {:.1} tok/s | gen: {} tok, {:.1} tok/s]",
        c.finish_reason,
        c.timings.prompt_n,
        c.timings.prompt_per_second(),
        c.tokens_predicted,
        c.timings.predicted_per_second(),
    );
}
