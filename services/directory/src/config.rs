//! Directory service configuration, sourced from environment variables
//! with an optional YAML override file (`CANOPY_CONFIG`).
use anyhow::{Context, Result};
use canopy_schema::SchemaConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;

pub const DEFAULT_MAX_RETRY: u32 = 10;

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    pub repository: RepositoryConfig,
    pub schema: SchemaSettings,
}

/// Options consumed by the entry repository.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_schema: String,
    pub db_name: String,
    pub db_max_open_conns: u32,
    pub db_max_idle_conns: u32,
    /// Identifies this node on the notification channel.
    pub server_id: String,
    pub log_level: String,
    /// Bound on immediate retries of transient conflicts.
    pub max_retry: u32,
}

/// Options consumed by the schema registry.
#[derive(Debug, Clone)]
pub struct SchemaSettings {
    pub suffix: String,
    pub root_dn: String,
    pub default_ppolicy_dn: String,
    /// Path of a file with extra schema lines, one definition per line.
    pub custom_schema_file: Option<String>,
    pub migration_enabled: bool,
}

impl SchemaSettings {
    pub fn to_schema_config(&self) -> Result<SchemaConfig> {
        let custom_schema = match &self.custom_schema_file {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("read CANOPY_CUSTOM_SCHEMA: {path}"))?
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        Ok(SchemaConfig {
            suffix: self.suffix.clone(),
            root_dn: self.root_dn.clone(),
            default_ppolicy_dn: self.default_ppolicy_dn.clone(),
            custom_schema,
            migration_enabled: self.migration_enabled,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryConfigOverride {
    metrics_bind: Option<String>,
    db_host: Option<String>,
    db_port: Option<u16>,
    db_user: Option<String>,
    db_password: Option<String>,
    db_schema: Option<String>,
    db_name: Option<String>,
    db_max_open_conns: Option<u32>,
    db_max_idle_conns: Option<u32>,
    server_id: Option<String>,
    log_level: Option<String>,
    max_retry: Option<u32>,
    suffix: Option<String>,
    root_dn: Option<String>,
    default_ppolicy_dn: Option<String>,
    custom_schema_file: Option<String>,
    migration_enabled: Option<bool>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}

impl DirectoryConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let metrics_bind = env_or("CANOPY_METRICS_BIND", "0.0.0.0:8080")
            .parse()
            .with_context(|| "parse CANOPY_METRICS_BIND")?;
        let suffix = env_or("CANOPY_SUFFIX", "dc=example,dc=com");
        let root_dn = env_or("CANOPY_ROOT_DN", &format!("cn=Manager,{suffix}"));
        Ok(DirectoryConfig {
            metrics_bind,
            repository: RepositoryConfig {
                db_host: env_or("CANOPY_DB_HOST", "localhost"),
                db_port: env_parse("CANOPY_DB_PORT", 5432)?,
                db_user: env_or("CANOPY_DB_USER", "canopy"),
                db_password: env_or("CANOPY_DB_PASSWORD", ""),
                db_schema: env_or("CANOPY_DB_SCHEMA", "public"),
                db_name: env_or("CANOPY_DB_NAME", "canopy"),
                db_max_open_conns: env_parse("CANOPY_DB_MAX_OPEN_CONNS", 20)?,
                db_max_idle_conns: env_parse("CANOPY_DB_MAX_IDLE_CONNS", 5)?,
                server_id: env_or("CANOPY_SERVER_ID", "canopy-1"),
                log_level: env_or("CANOPY_LOG_LEVEL", "info"),
                max_retry: env_parse("CANOPY_MAX_RETRY", DEFAULT_MAX_RETRY)?,
            },
            schema: SchemaSettings {
                suffix,
                root_dn,
                default_ppolicy_dn: env_or("CANOPY_DEFAULT_PPOLICY_DN", ""),
                custom_schema_file: std::env::var("CANOPY_CUSTOM_SCHEMA").ok(),
                migration_enabled: env_parse("CANOPY_MIGRATION_ENABLED", false)?,
            },
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CANOPY_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read CANOPY_CONFIG: {path}"))?;
            let override_cfg: DirectoryConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse directory config yaml")?;
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.db_host {
                config.repository.db_host = value;
            }
            if let Some(value) = override_cfg.db_port {
                config.repository.db_port = value;
            }
            if let Some(value) = override_cfg.db_user {
                config.repository.db_user = value;
            }
            if let Some(value) = override_cfg.db_password {
                config.repository.db_password = value;
            }
            if let Some(value) = override_cfg.db_schema {
                config.repository.db_schema = value;
            }
            if let Some(value) = override_cfg.db_name {
                config.repository.db_name = value;
            }
            if let Some(value) = override_cfg.db_max_open_conns {
                config.repository.db_max_open_conns = value;
            }
            if let Some(value) = override_cfg.db_max_idle_conns {
                config.repository.db_max_idle_conns = value;
            }
            if let Some(value) = override_cfg.server_id {
                config.repository.server_id = value;
            }
            if let Some(value) = override_cfg.log_level {
                config.repository.log_level = value;
            }
            if let Some(value) = override_cfg.max_retry {
                config.repository.max_retry = value;
            }
            if let Some(value) = override_cfg.suffix {
                config.schema.suffix = value;
            }
            if let Some(value) = override_cfg.root_dn {
                config.schema.root_dn = value;
            }
            if let Some(value) = override_cfg.default_ppolicy_dn {
                config.schema.default_ppolicy_dn = value;
            }
            if let Some(value) = override_cfg.custom_schema_file {
                config.schema.custom_schema_file = Some(value);
            }
            if let Some(value) = override_cfg.migration_enabled {
                config.schema.migration_enabled = value;
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    // Helper to clear all Canopy env vars.
    fn clear_canopy_env() {
        for (key, _) in env::vars() {
            if key.starts_with("CANOPY_") {
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_canopy_env();
        let config = DirectoryConfig::from_env().expect("from_env");
        assert_eq!(config.metrics_bind.to_string(), "0.0.0.0:8080");
        assert_eq!(config.repository.db_host, "localhost");
        assert_eq!(config.repository.db_port, 5432);
        assert_eq!(config.repository.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(config.schema.suffix, "dc=example,dc=com");
        assert_eq!(config.schema.root_dn, "cn=Manager,dc=example,dc=com");
        assert!(!config.schema.migration_enabled);
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_canopy_env();
        unsafe {
            env::set_var("CANOPY_DB_HOST", "db.internal");
            env::set_var("CANOPY_DB_PORT", "15432");
            env::set_var("CANOPY_SUFFIX", "dc=corp,dc=test");
            env::set_var("CANOPY_SERVER_ID", "node-7");
            env::set_var("CANOPY_MIGRATION_ENABLED", "true");
        }

        let config = DirectoryConfig::from_env().expect("from_env");
        assert_eq!(config.repository.db_host, "db.internal");
        assert_eq!(config.repository.db_port, 15432);
        assert_eq!(config.repository.server_id, "node-7");
        assert_eq!(config.schema.suffix, "dc=corp,dc=test");
        assert_eq!(config.schema.root_dn, "cn=Manager,dc=corp,dc=test");
        assert!(config.schema.migration_enabled);

        clear_canopy_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_invalid_values() {
        clear_canopy_env();
        unsafe {
            env::set_var("CANOPY_DB_PORT", "not-a-port");
        }
        assert!(DirectoryConfig::from_env().is_err());
        clear_canopy_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_overrides_with_valid_yaml() {
        clear_canopy_env();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("config.yml");
        std::fs::write(
            &config_path,
            r#"
metrics_bind: "127.0.0.1:7070"
db_host: "pg.example"
server_id: "node-2"
suffix: "dc=acme,dc=org"
migration_enabled: true
"#,
        )
        .unwrap();
        unsafe {
            env::set_var("CANOPY_CONFIG", config_path.to_str().unwrap());
        }

        let config = DirectoryConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.metrics_bind.to_string(), "127.0.0.1:7070");
        assert_eq!(config.repository.db_host, "pg.example");
        assert_eq!(config.repository.server_id, "node-2");
        assert_eq!(config.schema.suffix, "dc=acme,dc=org");
        assert!(config.schema.migration_enabled);

        clear_canopy_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_file_not_found_fails() {
        clear_canopy_env();
        let tmpdir = TempDir::new().unwrap();
        let nonexistent = tmpdir.path().join("nonexistent.yml");
        unsafe {
            env::set_var("CANOPY_CONFIG", nonexistent.to_str().unwrap());
        }
        assert!(DirectoryConfig::from_env_or_yaml().is_err());
        clear_canopy_env();
    }

    #[serial]
    #[test]
    fn custom_schema_file_is_loaded_line_by_line() {
        clear_canopy_env();
        let tmpdir = TempDir::new().unwrap();
        let schema_path = tmpdir.path().join("custom.schema");
        std::fs::write(
            &schema_path,
            "attributetypes: ( 1.3.6.1.4.1.99999.1.1 NAME 'canopyTag' EQUALITY caseIgnoreMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )\n",
        )
        .unwrap();
        unsafe {
            env::set_var("CANOPY_CUSTOM_SCHEMA", schema_path.to_str().unwrap());
        }

        let config = DirectoryConfig::from_env().expect("from_env");
        let schema_config = config.schema.to_schema_config().expect("schema config");
        assert_eq!(schema_config.custom_schema.len(), 1);
        assert!(schema_config.custom_schema[0].contains("canopyTag"));

        clear_canopy_env();
    }
}
