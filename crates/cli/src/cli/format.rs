use std::io::Read;

use crate::cli::{FormatArgs, GlobalArgs};
use crate::config::AppConfig;

pub async fn execute(global: GlobalArgs, args: FormatArgs) -> anyhow::Result<()> {
    let messages = if args.messages == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        args.messages
    };

    let cfg = AppConfig::load_or_default()?;
    let model = cfg.model_path(args.model)?;
    let ctx = super::load_context(model, super::model_params(&cfg, &global))?;

    let prompt = ctx.format_chat(&messages, args.template.as_deref())?;
    print!("{prompt}");
    ctx.invalidate();
    Ok(())
}
