use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
pub const DEFAULT_ENGINE_PROGRAM: &str = "yt-dlp";
pub const DEFAULT_VERSION_PREFIXES: [&str; 3] = ["2024", "2025", "2026"];
const WORK_DIR_NAME: &str = "mobile_downloads";
const CONFIG_FILE_NAME: &str = "api_key_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("could not write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("the API key is provided by the platform secret store and cannot be changed here")]
    ReadOnlySecret,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub program: String,
    pub user_agent: String,
    pub accept_language: String,
    pub tiktok_api_hostname: Option<String>,
    pub timeout: Option<Duration>,
    pub expected_version_prefixes: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENGINE_PROGRAM.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            tiktok_api_hostname: None,
            timeout: None,
            expected_version_prefixes: DEFAULT_VERSION_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub work_dir: PathBuf,
    pub config_file: PathBuf,
    pub api_key_secret: Option<String>,
    pub engine: EngineSettings,
    pub sync_threads_cookies: bool,
    pub cleanup_previous_download: bool,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(
            Path::new(env!("CARGO_MANIFEST_DIR")),
            |name| std::env::var(name).ok(),
        )
    }

    /// Builds the configuration from an arbitrary variable source. Relative
    /// defaults are resolved against `root`.
    pub fn from_lookup<F>(root: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };

        let bind_addr = resolve_bind_addr(var("APP_ADDR"), var("PORT"));
        let work_dir = var("WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(WORK_DIR_NAME));
        let config_file = var("CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(CONFIG_FILE_NAME));

        let expected_version_prefixes = var("ENGINE_VERSION_PREFIXES")
            .map(|value| split_list(&value))
            .filter(|prefixes| !prefixes.is_empty())
            .unwrap_or_else(|| EngineSettings::default().expected_version_prefixes);

        let engine = EngineSettings {
            program: var("YT_DLP_BIN").unwrap_or_else(|| DEFAULT_ENGINE_PROGRAM.to_string()),
            user_agent: var("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            accept_language: var("ACCEPT_LANGUAGE")
                .unwrap_or_else(|| DEFAULT_ACCEPT_LANGUAGE.to_string()),
            tiktok_api_hostname: var("TIKTOK_API_HOSTNAME"),
            timeout: var("EXTRACTION_TIMEOUT_SECONDS")
                .and_then(|value| parse_u64(&value))
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
            expected_version_prefixes,
        };

        Self {
            bind_addr,
            work_dir,
            config_file,
            api_key_secret: var("API_KEY"),
            engine,
            sync_threads_cookies: var("SYNC_THREADS_COOKIES")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(true),
            cleanup_previous_download: var("CLEANUP_PREVIOUS_DOWNLOAD")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(true),
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
        }
    }
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        AppConfig::from_lookup(Path::new("/srv/app"), |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]);

        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.work_dir, PathBuf::from("/srv/app/mobile_downloads"));
        assert_eq!(config.config_file, PathBuf::from("/srv/app/api_key_config.json"));
        assert!(config.api_key_secret.is_none());
        assert!(config.sync_threads_cookies);
        assert!(config.cleanup_previous_download);
        assert!(config.engine.timeout.is_none());
        assert!(config.engine.tiktok_api_hostname.is_none());
        assert_eq!(config.engine.program, "yt-dlp");
        assert_eq!(
            config.engine.expected_version_prefixes,
            vec!["2024", "2025", "2026"]
        );
    }

    #[test]
    fn port_is_used_when_app_addr_missing() {
        assert_eq!(config_from(&[("PORT", "9000")]).bind_addr, "0.0.0.0:9000");
        assert_eq!(
            config_from(&[("APP_ADDR", "10.0.0.1:81"), ("PORT", "9000")]).bind_addr,
            "10.0.0.1:81"
        );
        assert_eq!(config_from(&[("PORT", "nope")]).bind_addr, DEFAULT_BIND_ADDR);
    }

    #[test]
    fn flags_and_lists_are_parsed() {
        let config = config_from(&[
            ("SYNC_THREADS_COOKIES", "off"),
            ("CLEANUP_PREVIOUS_DOWNLOAD", "0"),
            ("ENGINE_VERSION_PREFIXES", " 2025, ,2026 "),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("EXTRACTION_TIMEOUT_SECONDS", "90"),
            ("API_KEY", "  secret "),
        ]);

        assert!(!config.sync_threads_cookies);
        assert!(!config.cleanup_previous_download);
        assert_eq!(config.engine.expected_version_prefixes, vec!["2025", "2026"]);
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.engine.timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.api_key_secret.as_deref(), Some("secret"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("USER_AGENT", "   "),
            ("EXTRACTION_TIMEOUT_SECONDS", "0"),
            ("SYNC_THREADS_COOKIES", "maybe"),
        ]);

        assert_eq!(config.engine.user_agent, DEFAULT_USER_AGENT);
        assert!(config.engine.timeout.is_none());
        assert!(config.sync_threads_cookies);
    }
}
