use std::sync::Arc;
use std::time::Duration;

use llama_bridge::{CompletionEvent, ContextWrapper, ErrorKind, FinishReason, Params, spawn_completion};
use llama_core::testing::{ScriptedEngine, write_model_fixture};

fn context(engine: &ScriptedEngine) -> (tempfile::TempDir, Arc<ContextWrapper>) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model_fixture(dir.path(), "tiny").unwrap();
    let ctx = ContextWrapper::initialize(engine, &path, &Params::new(), None).unwrap();
    (dir, Arc::new(ctx))
}

#[tokio::test]
async fn tokens_precede_done() {
    let (_dir, ctx) = context(&ScriptedEngine::new("one two three"));
    let mut rx = spawn_completion(ctx, Params::new().with("prompt", "count"), 1);

    let mut tokens = Vec::new();
    let mut done = None;
    while let Some(event) = rx.recv().await {
        assert!(done.is_none(), "event after the terminal one");
        match event {
            CompletionEvent::Token(t) => tokens.push(t),
            CompletionEvent::Done(c) => done = Some(c),
            CompletionEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }
    let done = done.expect("terminal event");
    assert_eq!(tokens, vec!["one ", "two ", "three"]);
    assert_eq!(tokens.concat(), done.text);
    assert_eq!(done.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn errors_are_terminal_events() {
    let (_dir, ctx) = context(&ScriptedEngine::new("a b c").failing_after(2));
    let mut rx = spawn_completion(ctx, Params::new().with("prompt", "go"), 8);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], CompletionEvent::Token(_)));
    assert!(matches!(events[1], CompletionEvent::Token(_)));
    assert!(matches!(&events[2], CompletionEvent::Error(e) if e.kind() == ErrorKind::Inference));
}

#[tokio::test]
async fn dropping_the_receiver_cancels() {
    let engine = ScriptedEngine::new("w ".repeat(200)).with_token_delay(Duration::from_millis(2));
    let (_dir, ctx) = context(&engine);
    let mut rx = spawn_completion(Arc::clone(&ctx), Params::new().with("prompt", "go"), 1);

    assert!(matches!(rx.recv().await, Some(CompletionEvent::Token(_))));
    drop(rx);

    // The worker notices on its next send and releases the session.
    let mut freed = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if ctx.tokenize("x").is_ok() {
            freed = true;
            break;
        }
    }
    assert!(freed, "completion kept running after the receiver was dropped");
}
