//! CLI configuration, persisted as JSON.

use std::path::{Path, PathBuf};

use anyhow::Context;
use llama_core::{ParamValue, Params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model used when a command is given none.
    #[serde(default)]
    pub default_model: Option<PathBuf>,
    /// Passed to every model load.
    #[serde(default)]
    pub model_params: Params,
    /// Base of every completion request.
    #[serde(default)]
    pub completion_params: Params,
}

impl AppConfig {
    /// Platform config directory: `~/.config/llama-bridge/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llama-bridge")
    }

    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_file())
    }

    /// Read `path`, or return defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_file())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply `config set <key> <value>`.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        if key == "default_model" {
            self.default_model = (!value.is_empty()).then(|| PathBuf::from(value));
        } else if let Some(param) = key.strip_prefix("model.") {
            set_param(&mut self.model_params, param, value)?;
        } else if let Some(param) = key.strip_prefix("completion.") {
            set_param(&mut self.completion_params, param, value)?;
        } else {
            anyhow::bail!(
                "Unknown config key: {key} (expected default_model, model.<param> or completion.<param>)"
            );
        }
        Ok(())
    }

    /// The model to load: `explicit` if given, else the configured default.
    pub fn model_path(&self, explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        explicit.or_else(|| self.default_model.clone()).context(
            "no model given and no default_model configured (llama-bridge config set default_model <path>)",
        )
    }
}

fn set_param(params: &mut Params, name: &str, value: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("empty parameter name");
    }
    // `null` removes the key instead of storing a null.
    match parse_value(value) {
        ParamValue::Null => {
            params.remove(name);
        }
        v => params.insert(name, v),
    }
    Ok(())
}

/// Parse a command-line value as JSON, falling back to a plain string.
pub fn parse_value(raw: &str) -> ParamValue {
    serde_json::from_str(raw).unwrap_or_else(|_| ParamValue::String(raw.to_owned()))
}

/// `key=value` argument parser for clap.
pub fn parse_assignment(arg: &str) -> Result<(String, ParamValue), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{arg}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{arg}'"));
    }
    Ok((key.to_owned(), parse_value(value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_json_or_strings() {
        assert_eq!(parse_value("42"), ParamValue::Int(42));
        assert_eq!(parse_value("0.5"), ParamValue::Float(0.5));
        assert_eq!(parse_value("true"), ParamValue::Bool(true));
        assert_eq!(parse_value("hello"), ParamValue::String("hello".into()));
        assert_eq!(parse_value(r#""42""#), ParamValue::String("42".into()));
        assert_eq!(
            parse_value(r#"["\n", "User:"]"#),
            ParamValue::List(vec!["\n".into(), "User:".into()])
        );
    }

    #[test]
    fn assignments() {
        assert_eq!(
            parse_assignment("n_predict=16").unwrap(),
            ("n_predict".to_string(), ParamValue::Int(16))
        );
        assert_eq!(
            parse_assignment("stop=a=b").unwrap(),
            ("stop".to_string(), ParamValue::String("a=b".into()))
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn set_keys() {
        let mut cfg = AppConfig::default();
        cfg.set("default_model", "/models/tiny.gguf").unwrap();
        cfg.set("model.n_ctx", "4096").unwrap();
        cfg.set("completion.temperature", "0.2").unwrap();
        cfg.set("completion.stop", "###").unwrap();
        assert_eq!(cfg.default_model, Some(PathBuf::from("/models/tiny.gguf")));
        assert_eq!(cfg.model_params.get_u32("n_ctx").unwrap(), Some(4096));
        assert_eq!(cfg.completion_params.get_f32("temperature").unwrap(), Some(0.2));

        cfg.set("completion.stop", "null").unwrap();
        assert!(!cfg.completion_params.contains_key("stop"));

        assert!(cfg.set("port", "8080").is_err());
        assert!(cfg.set("model.", "1").is_err());
    }

    #[test]
    fn persists_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());

        let mut cfg = AppConfig::default();
        cfg.set("model.n_gpu_layers", "0").unwrap();
        cfg.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn explicit_model_wins() {
        let cfg = AppConfig {
            default_model: Some("/a.gguf".into()),
            ..Default::default()
        };
        assert_eq!(cfg.model_path(Some("/b.gguf".into())).unwrap(), PathBuf::from("/b.gguf"));
        assert_eq!(cfg.model_path(None).unwrap(), PathBuf::from("/a.gguf"));
        assert!(AppConfig::default().model_path(None).is_err());
    }
}
