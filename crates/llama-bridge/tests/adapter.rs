use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use llama_bridge::{ContextWrapper, ErrorKind, FinishReason, LlamaError, Params};
use llama_core::testing::{DEFAULT_TEMPLATE, ScriptedEngine, write_model_fixture};

const REPLY: &str = "Paris is the capital of France.";

fn fixture() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model_fixture(dir.path(), "tiny").unwrap();
    (dir, path)
}

fn prompt(text: &str) -> Params {
    Params::new().with("prompt", text)
}

#[test]
fn valid_path_loads() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    assert!(ctx.is_loaded());
    assert_eq!(ctx.model_path(), path.as_path());
    assert_eq!(ctx.engine_name(), "scripted");
}

#[test]
fn nonexistent_path_is_a_load_error() {
    let engine = ScriptedEngine::new(REPLY);
    let err = ContextWrapper::initialize(
        &engine,
        "/definitely/not/here.gguf",
        &Params::new(),
        None,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Load);
    assert!(err.to_string().contains("/definitely/not/here.gguf"));
    assert_eq!(engine.load_count(), 0);
}

#[test]
fn unknown_model_params_are_forwarded_untouched() {
    let (_dir, path) = fixture();
    let params = Params::from_json(r#"{"n_ctx": 128, "use_mmap": false, "flash_attn": "auto"}"#)
        .unwrap();
    let ctx =
        ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &params, None).unwrap();
    assert!(ctx.is_loaded());
}

#[test]
fn token_callback_sees_exactly_the_result_text() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();

    let mut fragments = Vec::new();
    let mut on_token = |s: &str| fragments.push(s.to_owned());
    let c = ctx
        .complete(&prompt("Capital of France?"), Some(&mut on_token))
        .unwrap();

    assert_eq!(fragments.len(), c.fragments);
    assert_eq!(fragments.concat(), c.text);
    assert_eq!(c.text, REPLY);
    assert_eq!(c.finish_reason, FinishReason::Stop);

    let result = c.to_params();
    assert_eq!(result.get_str("text").unwrap(), Some(REPLY));
    assert_eq!(result.get_bool("stopped_eos").unwrap(), Some(true));
}

#[test]
fn completion_without_callback() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    let c = ctx
        .complete(&prompt("hi").with("n_predict", 2), None)
        .unwrap();
    assert_eq!(c.text, "Paris is ");
    assert_eq!(c.finish_reason, FinishReason::Length);
}

#[test]
fn stop_words_cut_the_reply() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    let mut fragments = Vec::new();
    let mut on_token = |s: &str| fragments.push(s.to_owned());
    let c = ctx
        .complete(
            &prompt("hi").with("stop", vec!["capital"]),
            Some(&mut on_token),
        )
        .unwrap();
    assert_eq!(c.text, "Paris is the ");
    assert_eq!(c.finish_reason, FinishReason::StopWord("capital".into()));
    assert_eq!(fragments.concat(), c.text);
}

#[test]
fn stop_word_spanning_several_fragments_is_cut_whole() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(
        &ScriptedEngine::new("Sure. User: hi there"),
        &path,
        &Params::new(),
        None,
    )
    .unwrap();
    let mut fragments = Vec::new();
    let mut on_token = |s: &str| fragments.push(s.to_owned());
    let c = ctx
        .complete(
            &prompt("hi").with("stop", vec![" User: hi"]),
            Some(&mut on_token),
        )
        .unwrap();
    assert_eq!(c.text, "Sure.");
    assert_eq!(c.finish_reason, FinishReason::StopWord(" User: hi".into()));
    assert_eq!(fragments.concat(), c.text);
    assert_eq!(fragments.len(), c.fragments);
}

#[test]
fn missing_prompt_is_an_inference_error() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    let err = ctx.complete(&Params::new(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Inference);
}

#[test]
fn invalidate_is_idempotent() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    ctx.invalidate();
    assert!(!ctx.is_loaded());
    ctx.invalidate();
    assert!(!ctx.is_loaded());
    // a stop request on a released context is a no-op
    ctx.stop_completion();
}

#[test]
fn operations_after_invalidate_are_not_loaded() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    ctx.invalidate();

    let err = ctx.complete(&prompt("hi"), None).unwrap_err();
    assert!(matches!(err, LlamaError::ModelNotLoaded));
    let err = ctx.format_chat(r#"[{"role":"user","content":"hi"}]"#, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLoaded);
    let err = ctx.format_chat("[{", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLoaded);
    assert_eq!(ctx.tokenize("x").unwrap_err().kind(), ErrorKind::NotLoaded);
    assert_eq!(ctx.detokenize(&[104]).unwrap_err().kind(), ErrorKind::NotLoaded);
    assert_eq!(ctx.model_details().unwrap_err().kind(), ErrorKind::NotLoaded);
}

#[test]
fn empty_template_equals_absent_template() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    let messages = r#"[{"role":"system","content":"Be brief."},{"role":"user","content":"Hi"}]"#;

    let default = ctx.format_chat(messages, None).unwrap();
    assert_eq!(ctx.format_chat(messages, Some("")).unwrap(), default);
    assert_eq!(ctx.format_chat(messages, Some("   ")).unwrap(), default);
    assert_eq!(
        default,
        "<|system|>\nBe brief.\n<|user|>\nHi\n<|assistant|>\n\n"
    );
    assert_eq!(
        ctx.model_details().unwrap().chat_template.as_deref(),
        Some(DEFAULT_TEMPLATE)
    );

    let custom = ctx.format_chat(messages, Some("{role}: {content}\n")).unwrap();
    assert_eq!(custom, "system: Be brief.\nuser: Hi\nassistant: \n");
}

#[test]
fn format_errors() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    let err = ctx.format_chat("[{", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    let err = ctx
        .format_chat(r#"[{"role":"user","content":"x"}]"#, Some("{{ bos_token }}"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn tokenize_round_trip() {
    let (_dir, path) = fixture();
    let ctx = ContextWrapper::initialize(&ScriptedEngine::new(REPLY), &path, &Params::new(), None)
        .unwrap();
    let tokens = ctx.tokenize("bonjour").unwrap();
    assert_eq!(ctx.detokenize(&tokens).unwrap(), "bonjour");
}

/// Start a slow completion on another thread and wait for its first token.
fn start_slow_completion(
    ctx: &Arc<ContextWrapper>,
) -> thread::JoinHandle<llama_bridge::Result<llama_bridge::Completion>> {
    let (first_tx, first_rx) = mpsc::channel();
    let worker = Arc::clone(ctx);
    let handle = thread::spawn(move || {
        let mut on_token = |_: &str| {
            let _ = first_tx.send(());
        };
        worker.complete(&prompt("go"), Some(&mut on_token))
    });
    first_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    handle
}

fn slow_context() -> (tempfile::TempDir, Arc<ContextWrapper>) {
    let (dir, path) = fixture();
    let engine = ScriptedEngine::new("w ".repeat(200)).with_token_delay(Duration::from_millis(5));
    let ctx = ContextWrapper::initialize(&engine, &path, &Params::new(), None).unwrap();
    (dir, Arc::new(ctx))
}

#[test]
fn overlapping_calls_are_rejected_as_busy() {
    let (_dir, ctx) = slow_context();
    let running = start_slow_completion(&ctx);

    assert!(matches!(ctx.complete(&prompt("again"), None), Err(LlamaError::Busy)));
    assert!(matches!(ctx.format_chat("[]", None), Err(LlamaError::Busy)));
    // is_loaded never waits for the lock
    assert!(ctx.is_loaded());

    ctx.stop_completion();
    let c = running.join().unwrap().unwrap();
    assert_eq!(c.finish_reason, FinishReason::Cancelled);
}

#[test]
fn stop_completion_returns_partial_text() {
    let (_dir, ctx) = slow_context();
    let running = start_slow_completion(&ctx);
    ctx.stop_completion();

    let c = running.join().unwrap().unwrap();
    assert!(c.interrupted());
    assert!(c.fragments >= 1);
    assert!(c.text.len() < 400);
    assert_eq!(c.text, "w ".repeat(c.fragments));
    assert_eq!(c.to_params().get_bool("interrupted").unwrap(), Some(true));
}

#[test]
fn invalidate_waits_for_the_running_completion() {
    let (_dir, ctx) = slow_context();
    let running = start_slow_completion(&ctx);

    ctx.invalidate();
    assert!(!ctx.is_loaded());
    // by now the worker has released the session
    let c = running.join().unwrap().unwrap();
    assert_eq!(c.finish_reason, FinishReason::Cancelled);
    assert!(matches!(
        ctx.complete(&prompt("go"), None),
        Err(LlamaError::ModelNotLoaded)
    ));
}
