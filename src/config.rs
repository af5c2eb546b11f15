#![forbid(unsafe_code)]

//! Runtime configuration.
//!
//! Two layers feed every binary: a small set of process-level settings (where
//! the config file lives, which address to bind) resolved from CLI overrides,
//! the environment and an optional `.env` file, and the JSON config file that
//! describes the library itself (`SavePath`, `Proxy`, providers, tools).

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CONFIG_PATH: &str = "cfg/configs.json";
pub const DEFAULT_WWW_ROOT: &str = "webui";
pub const DEFAULT_PORT: u16 = 8008;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_DOWNLOADER: &str = "m3u8-Downloader-Go";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub config_path: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub fetch_bin: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub config_path: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_paths(&file_vars, env_var_string, overrides))
}

/// Precedence for every key: explicit override, then the process
/// environment, then the `.env` file, then the compiled-in default.
fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimePaths {
    let config_path = overrides
        .config_path
        .or_else(|| lookup_value("NASVID_CONFIG", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("NASVID_WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("NASVID_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("NASVID_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let fetch_bin = lookup_value("NASVID_FETCH_BIN", file_vars, &env_lookup).map(PathBuf::from);

    RuntimePaths {
        config_path,
        www_root,
        port,
        host,
        fetch_bin,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Parses a dotenv-style file. A missing file is not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let raw = raw.trim();
        let value = unquote(raw, '"').or_else(|| unquote(raw, '\'')).unwrap_or(raw);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

fn unquote(value: &str, quote: char) -> Option<&str> {
    value.strip_prefix(quote)?.strip_suffix(quote)
}

/// A page source that can turn an identifier into a stream URL.
///
/// `pageUrls` are tried in order; `{id}` expands to the identifier and
/// `{id_lower}` to its lowercase form. Every pattern is a regular expression
/// whose first capture group (or whole match, when it has none) is the value.
/// `actorPattern` is the exception: it uses the named groups `name` and,
/// optionally, `thumb`. `keywordsPattern` captures a comma-separated list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub page_urls: Vec<String>,
    pub stream_pattern: String,
    #[serde(default)]
    pub title_pattern: Option<String>,
    #[serde(default)]
    pub poster_pattern: Option<String>,
    #[serde(default)]
    pub fanart_pattern: Option<String>,
    #[serde(default)]
    pub description_pattern: Option<String>,
    #[serde(default)]
    pub release_date_pattern: Option<String>,
    #[serde(default)]
    pub duration_pattern: Option<String>,
    #[serde(default)]
    pub actor_pattern: Option<String>,
    #[serde(default)]
    pub keywords_pattern: Option<String>,
}

fn default_weight() -> u32 {
    1
}

/// Contents of `configs.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppConfig {
    pub save_path: PathBuf,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub is_need_video_proxy: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_downloader")]
    pub downloader_path: PathBuf,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_downloader() -> PathBuf {
    PathBuf::from(DEFAULT_DOWNLOADER)
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from(DEFAULT_FFMPEG)
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&raw, base).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and normalizes a config document. Relative paths resolve
    /// against `base_dir`, the directory holding the config file.
    pub fn from_json(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut config: AppConfig = serde_json::from_str(raw)?;
        if config.save_path.as_os_str().is_empty() {
            bail!("SavePath must not be empty");
        }
        if config.save_path.is_relative() {
            config.save_path = base_dir.join(&config.save_path);
        }
        config.proxy = non_blank(config.proxy);
        config.token = non_blank(config.token);
        config.base_url = config.base_url.trim().trim_end_matches('/').to_string();
        Ok(config)
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Providers with a non-zero weight, heaviest first. Ties keep file order.
    pub fn enabled_providers(&self) -> Vec<ProviderConfig> {
        let mut providers: Vec<ProviderConfig> = self
            .providers
            .iter()
            .filter(|provider| provider.weight != 0)
            .cloned()
            .collect();
        providers.sort_by(|a, b| b.weight.cmp(&a.weight));
        providers
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
