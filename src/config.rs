use log::warn;
use std::path::PathBuf;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://bidesk.db?mode=rwc";
pub const DEFAULT_TOPLIST_LIMIT: u64 = 100;
pub const DEFAULT_TIMESERIES_LIMIT: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub toplist_limit: u64,
    pub timeseries_limit: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from("logs"),
            toplist_limit: DEFAULT_TOPLIST_LIMIT,
            timeseries_limit: DEFAULT_TIMESERIES_LIMIT,
        }
    }
}

impl AppConfig {
    /// 先加载 .env，再从环境变量读取配置；缺省或非法值回落到默认值
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.database_url),
            log_dir: lookup("BIDESK_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            toplist_limit: parse_limit(&lookup, "BIDESK_TOPLIST_LIMIT", defaults.toplist_limit),
            timeseries_limit: parse_limit(
                &lookup,
                "BIDESK_TIMESERIES_LIMIT",
                defaults.timeseries_limit,
            ),
        }
    }
}

fn parse_limit(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!("⚠ {}={} 无法解析，使用默认值 {}", key, raw, default);
                default
            }
        },
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        assert_eq!(AppConfig::from_lookup(lookup(&[])), AppConfig::default());
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("BIDESK_LOG_DIR", "/tmp/bidesk-logs"),
            ("BIDESK_TOPLIST_LIMIT", "25"),
            ("BIDESK_TIMESERIES_LIMIT", "lots"),
        ]));
        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/bidesk-logs"));
        assert_eq!(cfg.toplist_limit, 25);
        assert_eq!(cfg.timeseries_limit, DEFAULT_TIMESERIES_LIMIT);
    }
}
