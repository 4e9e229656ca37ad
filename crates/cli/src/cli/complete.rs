use std::io::Write;
use std::sync::Arc;

use llama_bridge::{Completion, CompletionEvent, ContextWrapper, Params, spawn_completion};
use tracing::warn;

use crate::cli::{CompleteArgs, GlobalArgs};
use crate::config::AppConfig;

pub async fn execute(global: GlobalArgs, args: CompleteArgs) -> anyhow::Result<()> {
    let cfg = AppConfig::load_or_default()?;
    let model = cfg.model_path(args.model)?;
    let ctx = super::load_context(model, super::model_params(&cfg, &global))?;

    let mut params = super::completion_params(&cfg, &args.params);
    params.insert("prompt", args.prompt);

    let completion = stream_to_stdout(&ctx, params, !args.json).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&completion.to_params())?);
    } else {
        println!();
    }
    super::print_stats(&completion);
    ctx.invalidate();
    Ok(())
}

/// Run a completion, echoing fragments to stdout when `echo` is set.
/// Ctrl-C stops generation and keeps what was produced.
pub async fn stream_to_stdout(
    ctx: &Arc<ContextWrapper>,
    params: Params,
    echo: bool,
) -> anyhow::Result<Completion> {
    let mut rx = spawn_completion(Arc::clone(ctx), params, 64);
    let mut stdout = std::io::stdout();
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!("Interrupted, stopping generation");
                interrupted = true;
                ctx.stop_completion();
                continue;
            }
        };
        match event {
            Some(CompletionEvent::Token(piece)) => {
                if echo {
                    print!("{piece}");
                    stdout.flush()?;
                }
            }
            Some(CompletionEvent::Done(c)) => return Ok(c),
            Some(CompletionEvent::Error(e)) => return Err(e.into()),
            None => anyhow::bail!("completion worker exited without a result"),
        }
    }
}
