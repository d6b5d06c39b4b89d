//! Process configuration.
//!
//! Loaded from an optional TOML file and overlaid with environment
//! variables, the way `bin/acp-server.rs`'s `Commands::Server { host,
//! port }` overrides a loaded `SystemConfig` before starting the server.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `SERVER_ID` — identity stamped into ConnectionRecords.
    pub server_id: String,
    /// `BUS_URL` — message-bus endpoint.
    pub bus_url: String,
    /// `COUNTER_STORE_URL` — also backs the connection registry and the
    /// challenge store; one Redis logical store.
    pub counter_store_url: String,
    /// `DATABASE_URL` — Postgres connection string for `daily_usage`.
    pub database_url: String,
    /// `REGISTRY_TABLE` — connection registry table/keyspace name.
    pub registry_table: String,
    /// `JWT_ISSUER` — dashboard token validation.
    pub jwt_issuer: String,
    /// `JWT_AUDIENCE` — dashboard token validation.
    pub jwt_audience: String,
    /// `JWT_HMAC_SECRET` — symmetric key backing dashboard JWT signatures.
    /// Asymmetric issuer keys belong to the out-of-scope CRUD surface;
    /// this is the in-tree default for tests and single-issuer deployments.
    pub jwt_hmac_secret: String,
    /// `LISTEN_ADDR` — HTTP listen address for the upgrade endpoints.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "relay-dev".to_string(),
            bus_url: "nats://127.0.0.1:4222".to_string(),
            counter_store_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgres://localhost/relay".to_string(),
            registry_table: "connections".to_string(),
            jwt_issuer: "relay".to_string(),
            jwt_audience: "relay-dashboard".to_string(),
            jwt_hmac_secret: "dev-secret-change-me".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay values present in the process environment on top of
    /// whatever was loaded from file (or the defaults).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("SERVER_ID") {
            self.server_id = v;
        }
        if let Ok(v) = std::env::var("BUS_URL") {
            self.bus_url = v;
        }
        if let Ok(v) = std::env::var("COUNTER_STORE_URL") {
            self.counter_store_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Ok(v) = std::env::var("REGISTRY_TABLE") {
            self.registry_table = v;
        }
        if let Ok(v) = std::env::var("JWT_ISSUER") {
            self.jwt_issuer = v;
        }
        if let Ok(v) = std::env::var("JWT_AUDIENCE") {
            self.jwt_audience = v;
        }
        if let Ok(v) = std::env::var("JWT_HMAC_SECRET") {
            self.jwt_hmac_secret = v;
        }
        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        self
    }

    /// Load from an optional config file, then apply environment
    /// overrides. Missing file falls back to defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let base = match path {
            Some(p) if std::path::Path::new(p).exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        Ok(base.with_env_overrides())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            server_id = "relay-1"
            bus_url = "nats://bus:4222"
            counter_store_url = "redis://cache:6379"
            database_url = "postgres://db/relay"
            registry_table = "connections"
            jwt_issuer = "issuer"
            jwt_audience = "aud"
            jwt_hmac_secret = "test-secret"
            listen_addr = "0.0.0.0:9000"
            "#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server_id, "relay-1");
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
    }

    #[test]
    fn falls_back_to_defaults_without_a_file() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.server_id, "relay-dev");
    }

    #[test]
    fn env_overrides_take_precedence() {
        std::env::set_var("SERVER_ID", "relay-env-test");
        let config = ServerConfig::default().with_env_overrides();
        assert_eq!(config.server_id, "relay-env-test");
        std::env::remove_var("SERVER_ID");
    }
}
