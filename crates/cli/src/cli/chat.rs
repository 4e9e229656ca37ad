use std::io::{self, BufRead, Write};

use llama_bridge::ChatMessage;
use tracing::info;

use crate::cli::{ChatArgs, GlobalArgs};
use crate::config::AppConfig;

pub async fn execute(global: GlobalArgs, args: ChatArgs) -> anyhow::Result<()> {
    let cfg = AppConfig::load_or_default()?;
    let model = cfg.model_path(args.model)?;
    let ctx = super::load_context(model, super::model_params(&cfg, &global))?;
    let base = super::completion_params(&cfg, &args.params);

    let system = args
        .system
        .as_deref()
        .unwrap_or("You are a helpful assistant.");
    let mut history = vec![ChatMessage::new("system", system)];

    println!("Model loaded. Type your message (Ctrl-D to quit, Ctrl-C stops a reply).\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let Some(line) = read_turn(&mut stdin.lock())? else {
            println!();
            break;
        };
        if line.is_empty() {
            continue;
        }
        history.push(ChatMessage::new("user", line));

        let prompt = ctx.format_messages(&history, args.template.as_deref())?;
        let mut params = base.clone();
        params.insert("prompt", prompt);

        match super::complete::stream_to_stdout(&ctx, params, true).await {
            Ok(c) => {
                println!();
                super::print_stats(&c);
                history.push(ChatMessage::new("assistant", c.text));
            }
            Err(e) => {
                eprintln!("\nError: {e}");
                // Drop the unanswered turn so the history stays well-formed.
                history.pop();
            }
        }
        println!();
    }

    info!(turns = history.len() / 2, "Chat finished");
    ctx.invalidate();
    Ok(())
}

/// Read one trimmed line off the runtime's worker threads. `None` at EOF.
fn read_turn(input: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let n = tokio::task::block_in_place(|| input.read_line(&mut line))?;
    Ok((n > 0).then(|| line.trim().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::read_turn;

    #[tokio::test(flavor = "multi_thread")]
    async fn turns_are_read_until_eof() {
        let mut input = std::io::Cursor::new("  hello \n\nbye");
        assert_eq!(read_turn(&mut input).unwrap().as_deref(), Some("hello"));
        assert_eq!(read_turn(&mut input).unwrap().as_deref(), Some(""));
        assert_eq!(read_turn(&mut input).unwrap().as_deref(), Some("bye"));
        assert_eq!(read_turn(&mut input).unwrap(), None);
    }
}
