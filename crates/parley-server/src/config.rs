use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use parley_chat::limits::LimitsConfig;

/// Secrets that ship in templates and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "change-me", "changeme", "secret"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub model_api_url: String,
    pub model_api_key: String,
    pub title_model: String,
    pub limits: LimitsConfig,
    pub stream_retention: Duration,
    pub max_streams: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("PARLEY_JWT_SECRET").context("PARLEY_JWT_SECRET must be set")?;
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is a placeholder; set a real secret");
        }

        let defaults = LimitsConfig::default();
        Ok(Self {
            host: get("PARLEY_HOST", "0.0.0.0"),
            port: parse(&lookup, "PARLEY_PORT", 3000)?,
            db_path: PathBuf::from(get("PARLEY_DB_PATH", "parley.db")),
            jwt_secret,
            model_api_url: get("PARLEY_MODEL_API_URL", "https://api.openai.com/v1"),
            model_api_key: get("PARLEY_MODEL_API_KEY", ""),
            title_model: get("PARLEY_TITLE_MODEL", "gpt-4o-mini"),
            limits: LimitsConfig {
                anonymous: parse(&lookup, "PARLEY_LIMIT_ANONYMOUS", defaults.anonymous)?,
                free: parse(&lookup, "PARLEY_LIMIT_FREE", defaults.free)?,
                pro: parse(&lookup, "PARLEY_LIMIT_PRO", defaults.pro)?,
            },
            stream_retention: Duration::from_secs(parse(&lookup, "PARLEY_STREAM_RETENTION_SECS", 300)?),
            max_streams: parse(&lookup, "PARLEY_MAX_STREAMS", 1024)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("{key} is not valid: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_secret_is_set() {
        let config = config(&[("PARLEY_JWT_SECRET", "a-real-secret")]).unwrap();
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.limits.anonymous, 10);
        assert_eq!(config.limits.pro, 1500);
        assert_eq!(config.stream_retention, Duration::from_secs(300));
        assert_eq!(config.title_model, "gpt-4o-mini");
    }

    #[test]
    fn missing_or_placeholder_secret_is_rejected() {
        assert!(config(&[]).is_err());
        assert!(config(&[("PARLEY_JWT_SECRET", "dev-secret-change-me")]).is_err());
        assert!(config(&[("PARLEY_JWT_SECRET", "  ")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("PARLEY_JWT_SECRET", "a-real-secret"),
            ("PARLEY_PORT", "8080"),
            ("PARLEY_LIMIT_FREE", "75"),
            ("PARLEY_MAX_STREAMS", "8"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.limits.free, 75);
        assert_eq!(config.max_streams, 8);
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = config(&[("PARLEY_JWT_SECRET", "a-real-secret"), ("PARLEY_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PARLEY_PORT"));
    }
}
