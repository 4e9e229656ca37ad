//! Completions as an async event stream.

use std::sync::Arc;

use llama_core::{Completion, LlamaError, Params};
use tokio::sync::mpsc;
use tracing::debug;

use crate::wrapper::ContextWrapper;

#[derive(Debug)]
pub enum CompletionEvent {
    /// One generated fragment.
    Token(String),
    /// The completion finished; always the last event on success.
    Done(Completion),
    /// The completion failed; always the last event on failure.
    Error(LlamaError),
}

/// Run [`ContextWrapper::complete`] on tokio's blocking pool and stream its
/// fragments.
///
/// Every `Token` precedes the single terminal `Done` or `Error`. Dropping
/// the receiver stops the completion at the next fragment. Must be called
/// from within a tokio runtime.
pub fn spawn_completion(
    ctx: Arc<ContextWrapper>,
    params: Params,
    buffer: usize,
) -> mpsc::Receiver<CompletionEvent> {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::task::spawn_blocking(move || {
        let mut on_token = |piece: &str| {
            if tx
                .blocking_send(CompletionEvent::Token(piece.to_owned()))
                .is_err()
            {
                debug!("Stream receiver dropped, stopping completion");
                ctx.stop_completion();
            }
        };
        let event = match ctx.complete(&params, Some(&mut on_token)) {
            Ok(completion) => CompletionEvent::Done(completion),
            Err(e) => CompletionEvent::Error(e),
        };
        let _ = tx.blocking_send(event);
    });

    rx
}
