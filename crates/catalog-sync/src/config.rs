use std::path::PathBuf;
use std::time::Duration;

use catalog_feeds::EchoesEndpoints;
use catalog_storage::{BackoffPolicy, HttpClientConfig};
use thiserror::Error;

pub const DEFAULT_CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_ITEMS_API_URL: &str = "https://echoes.mobi/api/items";
pub const DEFAULT_HISTORY_API_URL: &str = "https://echoes.mobi/api/item_weekly_average_prices";
pub const DEFAULT_CURRENT_PRICES_API_URL: &str = "https://echoes.mobi/api/v2/item_prices";
pub const DEFAULT_ICON_URL_TEMPLATE: &str = "https://echoes.mobi/files/icons/{icon_id}.png";
pub const DEFAULT_ASSET_BUCKET: &str = "catalog-assets";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudflareConfig {
    pub api_base: String,
    pub account_id: String,
    pub api_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    D1 { database_id: String },
    Sqlite { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetBackend {
    R2,
    Directory { root: PathBuf },
}

/// Settings for one process, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreBackend,
    pub assets: AssetBackend,
    /// Present whenever either backend talks to Cloudflare.
    pub cloudflare: Option<CloudflareConfig>,
    pub asset_bucket: String,
    pub endpoints: EchoesEndpoints,
    pub snapshot_path: PathBuf,
    pub icon_staging_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub request_delay: Duration,
    pub http_timeout: Duration,
    pub http_max_retries: usize,
    pub max_pages: Option<u32>,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Blank values count as unset, and every
    /// missing required variable is reported at once.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut missing = Vec::new();
        let mut require = |name: &str| match get(name) {
            Some(value) => value,
            None => {
                missing.push(name.to_string());
                String::new()
            }
        };

        let store = match get("CATALOG_STORE").as_deref() {
            None | Some("d1") => StoreBackend::D1 {
                database_id: require("CLOUDFLARE_D1_DATABASE_ID"),
            },
            Some(other) => match other.strip_prefix("sqlite:") {
                Some(_) => StoreBackend::Sqlite {
                    url: other.to_string(),
                },
                None => {
                    return Err(ConfigError::Invalid {
                        name: "CATALOG_STORE",
                        value: other.to_string(),
                        reason: "expected `d1` or `sqlite:<url>`".to_string(),
                    })
                }
            },
        };

        let (assets, r2_bucket) = match get("CATALOG_ASSETS").as_deref() {
            None | Some("r2") => (AssetBackend::R2, Some(require("CLOUDFLARE_R2_BUCKET_NAME"))),
            Some(other) => match other.strip_prefix("dir:") {
                Some(root) if !root.is_empty() => (
                    AssetBackend::Directory {
                        root: PathBuf::from(root),
                    },
                    None,
                ),
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "CATALOG_ASSETS",
                        value: other.to_string(),
                        reason: "expected `r2` or `dir:<path>`".to_string(),
                    })
                }
            },
        };

        let needs_cloudflare =
            matches!(store, StoreBackend::D1 { .. }) || matches!(assets, AssetBackend::R2);
        let cloudflare = if needs_cloudflare {
            Some(CloudflareConfig {
                api_base: get("CLOUDFLARE_API_BASE")
                    .unwrap_or_else(|| DEFAULT_CLOUDFLARE_API_BASE.to_string()),
                account_id: require("CLOUDFLARE_ACCOUNT_ID"),
                api_token: require("CLOUDFLARE_API_TOKEN"),
            })
        } else {
            None
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let asset_bucket = r2_bucket
            .or_else(|| get("CLOUDFLARE_R2_BUCKET_NAME"))
            .unwrap_or_else(|| DEFAULT_ASSET_BUCKET.to_string());

        Ok(Self {
            store,
            assets,
            cloudflare,
            asset_bucket,
            endpoints: EchoesEndpoints {
                items_url: get("ITEMS_API_URL").unwrap_or_else(|| DEFAULT_ITEMS_API_URL.to_string()),
                history_url: get("HISTORY_API_URL")
                    .unwrap_or_else(|| DEFAULT_HISTORY_API_URL.to_string()),
                current_prices_url: get("CURRENT_PRICES_API_URL")
                    .unwrap_or_else(|| DEFAULT_CURRENT_PRICES_API_URL.to_string()),
                icon_url_template: get("ICON_URL_TEMPLATE")
                    .unwrap_or_else(|| DEFAULT_ICON_URL_TEMPLATE.to_string()),
            },
            snapshot_path: get("SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("item_lists.csv")),
            icon_staging_dir: get("ICON_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("icons")),
            reports_dir: get("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("reports")),
            request_delay: Duration::from_millis(parse_number(
                "REQUEST_DELAY_MS",
                get("REQUEST_DELAY_MS"),
                500,
            )?),
            http_timeout: Duration::from_secs(parse_number(
                "HTTP_TIMEOUT_SECS",
                get("HTTP_TIMEOUT_SECS"),
                30,
            )?),
            http_max_retries: parse_number("HTTP_MAX_RETRIES", get("HTTP_MAX_RETRIES"), 0)?,
            max_pages: get("MAX_PAGES")
                .map(|v| parse_number("MAX_PAGES", Some(v), 0))
                .transpose()?,
            user_agent: get("CATALOG_USER_AGENT")
                .unwrap_or_else(|| "catalog-sync/0.1".to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            request_delay: self.request_delay,
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
        }
    }
}

fn parse_number<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn reports_every_missing_cloudflare_variable() {
        let err = config_from(&[]).expect_err("missing");
        assert_eq!(
            err,
            ConfigError::Missing(vec![
                "CLOUDFLARE_D1_DATABASE_ID".to_string(),
                "CLOUDFLARE_R2_BUCKET_NAME".to_string(),
                "CLOUDFLARE_ACCOUNT_ID".to_string(),
                "CLOUDFLARE_API_TOKEN".to_string(),
            ])
        );
    }

    #[test]
    fn blank_values_count_as_missing() {
        let err = config_from(&[
            ("CLOUDFLARE_D1_DATABASE_ID", "db"),
            ("CLOUDFLARE_R2_BUCKET_NAME", "bucket"),
            ("CLOUDFLARE_ACCOUNT_ID", "acct"),
            ("CLOUDFLARE_API_TOKEN", "   "),
        ])
        .expect_err("missing token");
        assert_eq!(
            err,
            ConfigError::Missing(vec!["CLOUDFLARE_API_TOKEN".to_string()])
        );
    }

    #[test]
    fn cloudflare_defaults() {
        let config = config_from(&[
            ("CLOUDFLARE_D1_DATABASE_ID", "db"),
            ("CLOUDFLARE_R2_BUCKET_NAME", "bucket"),
            ("CLOUDFLARE_ACCOUNT_ID", "acct"),
            ("CLOUDFLARE_API_TOKEN", "token"),
        ])
        .expect("config");

        assert_eq!(
            config.store,
            StoreBackend::D1 {
                database_id: "db".to_string()
            }
        );
        assert_eq!(config.assets, AssetBackend::R2);
        assert_eq!(config.asset_bucket, "bucket");
        let cloudflare = config.cloudflare.expect("cloudflare");
        assert_eq!(cloudflare.api_base, DEFAULT_CLOUDFLARE_API_BASE);
        assert_eq!(config.request_delay, Duration::from_millis(500));
        assert_eq!(config.http_max_retries, 0);
        assert_eq!(config.max_pages, None);
        assert_eq!(config.snapshot_path, PathBuf::from("item_lists.csv"));
    }

    #[test]
    fn local_backends_need_no_credentials() {
        let config = config_from(&[
            ("CATALOG_STORE", "sqlite:catalog.db"),
            ("CATALOG_ASSETS", "dir:assets"),
            ("MAX_PAGES", "3"),
            ("REQUEST_DELAY_MS", "0"),
        ])
        .expect("config");

        assert!(config.cloudflare.is_none());
        assert_eq!(
            config.store,
            StoreBackend::Sqlite {
                url: "sqlite:catalog.db".to_string()
            }
        );
        assert_eq!(
            config.assets,
            AssetBackend::Directory {
                root: PathBuf::from("assets")
            }
        );
        assert_eq!(config.asset_bucket, DEFAULT_ASSET_BUCKET);
        assert_eq!(config.max_pages, Some(3));
        assert_eq!(config.request_delay, Duration::ZERO);
    }

    #[test]
    fn rejects_unparseable_numbers_and_unknown_backends() {
        let err = config_from(&[
            ("CATALOG_STORE", "sqlite::memory:"),
            ("CATALOG_ASSETS", "dir:assets"),
            ("HTTP_TIMEOUT_SECS", "soon"),
        ])
        .expect_err("invalid");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "HTTP_TIMEOUT_SECS",
                ..
            }
        ));

        let err = config_from(&[("CATALOG_STORE", "postgres://x")]).expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid { name: "CATALOG_STORE", .. }));
    }
}
