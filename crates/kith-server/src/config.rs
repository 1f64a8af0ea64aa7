use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub require_auth: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("KITH_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("KITH_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let port = var("KITH_PORT", "8000");
        let port: u16 = port
            .parse()
            .with_context(|| format!("KITH_PORT must be a port number, got {:?}", port))?;

        let ttl = var("KITH_TOKEN_TTL_SECS", "3600");
        let ttl: u64 = ttl
            .parse()
            .with_context(|| format!("KITH_TOKEN_TTL_SECS must be whole seconds, got {:?}", ttl))?;
        if ttl == 0 {
            bail!("KITH_TOKEN_TTL_SECS must be greater than zero");
        }

        let require_auth = parse_flag(&var("KITH_REQUIRE_AUTH", "false"))
            .context("KITH_REQUIRE_AUTH must be true or false")?;

        Ok(Self {
            host: var("KITH_HOST", "0.0.0.0"),
            port,
            db_path: var("KITH_DB_PATH", "kith.db").into(),
            upload_dir: var("KITH_UPLOAD_DIR", "./files").into(),
            jwt_secret,
            token_ttl: Duration::from_secs(ttl),
            require_auth,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("unrecognised flag value {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_with_only_a_secret() {
        let cfg = load(&[("KITH_JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.db_path, PathBuf::from("kith.db"));
        assert_eq!(cfg.upload_dir, PathBuf::from("./files"));
        assert_eq!(cfg.token_ttl, Duration::from_secs(3600));
        assert!(!cfg.require_auth);
        assert_eq!(cfg.addr().unwrap().port(), 8000);
    }

    #[test]
    fn missing_or_placeholder_secret_is_fatal() {
        assert!(load(&[]).is_err());
        assert!(load(&[("KITH_JWT_SECRET", "  ")]).is_err());
        assert!(load(&[("KITH_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = load(&[
            ("KITH_JWT_SECRET", "s3cret"),
            ("KITH_HOST", "127.0.0.1"),
            ("KITH_PORT", "9100"),
            ("KITH_TOKEN_TTL_SECS", "60"),
            ("KITH_REQUIRE_AUTH", "yes"),
        ])
        .unwrap();
        assert_eq!(cfg.addr().unwrap().to_string(), "127.0.0.1:9100");
        assert_eq!(cfg.token_ttl, Duration::from_secs(60));
        assert!(cfg.require_auth);
    }

    #[test]
    fn bad_values_are_rejected() {
        let secret = ("KITH_JWT_SECRET", "s3cret");
        assert!(load(&[secret, ("KITH_PORT", "eighty")]).is_err());
        assert!(load(&[secret, ("KITH_PORT", "70000")]).is_err());
        assert!(load(&[secret, ("KITH_TOKEN_TTL_SECS", "0")]).is_err());
        assert!(load(&[secret, ("KITH_REQUIRE_AUTH", "maybe")]).is_err());
    }
}
