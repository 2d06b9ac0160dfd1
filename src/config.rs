use std::{env, time::Duration};

use crate::{Error, Result};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_RELIST_SECS: u64 = 300;

/// How log lines are rendered
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Connection settings for the object storage backend
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// URL the operator uses to reach the backend
    pub endpoint: String,

    /// Base URL published in bucket statuses
    pub external_endpoint: String,

    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Everything the operator needs at start-up
#[derive(Clone, Debug)]
pub struct Config {
    pub storage: StorageConfig,

    /// How often ready buckets are re-verified against the backend
    pub relist_interval: Duration,

    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| Error::ConfigError(format!("missing {key} environment variable")))
        };

        let endpoint = required("STORAGE_ENDPOINT")?;
        let storage = StorageConfig {
            external_endpoint: var("STORAGE_EXTERNAL_ENDPOINT").unwrap_or_else(|| endpoint.clone()),
            access_key: required("STORAGE_ACCESS_KEY")?,
            secret_key: required("STORAGE_SECRET_KEY")?,
            region: var("STORAGE_REGION").unwrap_or_else(|| DEFAULT_REGION.into()),
            endpoint,
        };

        let relist_interval = match var("BUCKET_RELIST_INTERVAL") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    Error::ConfigError(format!("BUCKET_RELIST_INTERVAL is not a number of seconds: {raw}"))
                })?;
                if secs == 0 {
                    return Err(Error::ConfigError("BUCKET_RELIST_INTERVAL must be positive".into()));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_RELIST_SECS),
        };

        let log_format = match var("OPERATOR_LOG_FORMAT").as_deref() {
            None | Some("compact") => LogFormat::Compact,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(Error::ConfigError(format!("unknown OPERATOR_LOG_FORMAT {other}")))
            }
        };

        Ok(Config {
            storage,
            relist_interval,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("STORAGE_ENDPOINT", "http://minio:9000"),
        ("STORAGE_ACCESS_KEY", "admin"),
        ("STORAGE_SECRET_KEY", "secret"),
    ];

    #[test]
    fn defaults() {
        let config = load(MINIMAL).unwrap();
        assert_eq!(config.storage.external_endpoint, "http://minio:9000");
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.relist_interval, Duration::from_secs(300));
        assert_eq!(config.log_format, LogFormat::Compact);
    }

    #[test]
    fn overrides() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("STORAGE_EXTERNAL_ENDPOINT", "https://assets.example.com"),
            ("STORAGE_REGION", "eu-west-1"),
            ("BUCKET_RELIST_INTERVAL", "30"),
            ("OPERATOR_LOG_FORMAT", "json"),
        ]);

        let config = load(&vars).unwrap();
        assert_eq!(config.storage.external_endpoint, "https://assets.example.com");
        assert_eq!(config.storage.region, "eu-west-1");
        assert_eq!(config.relist_interval, Duration::from_secs(30));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn missing_credentials() {
        let err = load(&MINIMAL[..2]).unwrap_err();
        assert!(err.to_string().contains("STORAGE_SECRET_KEY"));
    }

    #[test]
    fn bad_relist_interval() {
        for bad in ["soon", "0", "-5"] {
            let mut vars = MINIMAL.to_vec();
            vars.push(("BUCKET_RELIST_INTERVAL", bad));
            assert!(matches!(load(&vars), Err(Error::ConfigError(_))), "{bad}");
        }
    }
}
