use std::env;

use anyhow::{anyhow, Context, Result};

/// Process configuration, read once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub port: u16,
    pub jwt_secret: String,
    pub access_token_ttl_minutes: i64,
    pub certificate_prefix: String,
    pub max_body_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL not set"))?;
        let jwt_secret = lookup("JWT_SECRET").ok_or_else(|| anyhow!("JWT_SECRET not set"))?;
        if jwt_secret.len() < 16 {
            return Err(anyhow!("JWT_SECRET must be at least 16 bytes"));
        }

        Ok(Self {
            database_url,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            port: parse_or(&lookup, "PORT", 8081)?,
            jwt_secret,
            access_token_ttl_minutes: parse_or(&lookup, "ACCESS_TOKEN_TTL_MINUTES", 15)?,
            certificate_prefix: lookup("CERTIFICATE_PREFIX").unwrap_or_else(|| "CERT".into()),
            max_body_bytes: parse_or(&lookup, "MAX_BODY_BYTES", 1024 * 1024)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.parse().with_context(|| format!("invalid {}", key)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_fill_optional_keys() {
        let cfg = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/edu"),
            ("JWT_SECRET", "0123456789abcdef0123"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.access_token_ttl_minutes, 15);
        assert_eq!(cfg.certificate_prefix, "CERT");
        assert_eq!(cfg.db_max_connections, 10);
    }

    #[test]
    fn missing_secret_is_rejected() {
        let err = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn bad_port_is_reported() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("JWT_SECRET", "0123456789abcdef0123"),
            ("PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
