use std::path::PathBuf;

use anyhow::Context;

pub async fn execute(model: PathBuf) -> anyhow::Result<()> {
    let probe = llama_core::probe(&model)
        .with_context(|| format!("reading {}", model.display()))?;

    println!("File:          {}", probe.path.display());
    println!("Size:          {}", human_size(probe.file_size));
    println!("GGUF version:  {}", probe.version);
    println!("Tensors:       {}", probe.tensor_count);
    println!("Architecture:  {}", probe.architecture().unwrap_or("-"));
    println!("Name:          {}", probe.name().unwrap_or("-"));
    println!(
        "Context:       {}",
        probe
            .context_length()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into())
    );
    println!(
        "Chat template: {}",
        if probe.chat_template().is_some() { "yes" } else { "no" }
    );
    println!("\n{}", serde_json::to_string_pretty(&probe.metadata)?);
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}

#[cfg(test)]
mod tests {
    use super::human_size;

    #[test]
    fn sizes() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(4 * 1024 * 1024 * 1024), "4.0 GiB");
    }
}
