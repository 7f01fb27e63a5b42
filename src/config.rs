//! Configuration for the capture proxy
//!
//! Configuration is loaded in order of precedence:
//! 1. CLI flags (applied by the caller, highest priority)
//! 2. Environment variables with the INTERCEPTOR_ prefix
//! 3. Config file (~/.config/llmtap/config.toml)
//! 4. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the proxy server to
    pub host: String,
    pub port: u16,

    /// Path to the SQLite interaction database
    pub db_path: PathBuf,

    /// Per-provider upstream base URLs
    pub openai_url: String,
    pub anthropic_url: String,
    pub ollama_url: String,

    /// Log chatter: verbose wins over quiet when both are set
    pub verbose: bool,
    pub quiet: bool,

    /// Redact secrets from stored headers (requests are always forwarded
    /// verbatim regardless)
    pub redact: bool,
    /// Also run the redactor over stored request bodies
    pub redact_body: bool,

    /// Persist per-frame stream chunks
    pub store_chunks: bool,

    /// Seconds to wait for in-flight captures on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from("./llmtap.db"),
            openai_url: "https://api.openai.com".to_string(),
            anthropic_url: "https://api.anthropic.com".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            verbose: false,
            quiet: false,
            redact: true,
            redact_body: false,
            store_chunks: true,
            shutdown_grace_secs: 30,
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| {
                anyhow::anyhow!("invalid listen address {}:{}: {}", self.host, self.port, e)
            })
    }

    /// Base URL for a classified provider. Passthrough traffic goes to the
    /// OpenAI-compatible upstream, the broadest of the three.
    pub fn upstream_url(&self, provider: crate::model::Provider) -> &str {
        use crate::model::Provider;
        match provider {
            Provider::OpenAi | Provider::Passthrough => &self.openai_url,
            Provider::Anthropic => &self.anthropic_url,
            Provider::Ollama => &self.ollama_url,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<String>,
    pub openai_url: Option<String>,
    pub anthropic_url: Option<String>,
    pub ollama_url: Option<String>,
    pub verbose: Option<bool>,
    pub quiet: Option<bool>,
    pub redact: Option<bool>,
    pub redact_body: Option<bool>,
    pub store_chunks: Option<bool>,
    pub shutdown_grace_secs: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/llmtap/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("llmtap").join("config.toml"))
    }

    /// Create the config file with defaults if it doesn't exist, so users
    /// can discover the options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Config file is optional
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Render the effective configuration as a commented TOML template
    pub fn to_toml(&self) -> String {
        format!(
            r#"# llmtap configuration
# Values here are overridden by INTERCEPTOR_* environment variables
# and by CLI flags.

host = "{host}"
port = {port}
db_path = "{db_path}"

# Upstream base URLs per provider
openai_url = "{openai_url}"
anthropic_url = "{anthropic_url}"
ollama_url = "{ollama_url}"

verbose = {verbose}
quiet = {quiet}

# Redact secrets from stored headers (forwarded traffic is never modified)
redact = {redact}
# Also run redaction over stored request bodies
redact_body = {redact_body}

# Persist individual stream chunks (disable to keep only assembled rows)
store_chunks = {store_chunks}

# Seconds to wait for in-flight requests on shutdown
shutdown_grace_secs = {grace}
"#,
            host = self.host,
            port = self.port,
            db_path = self.db_path.display(),
            openai_url = self.openai_url,
            anthropic_url = self.anthropic_url,
            ollama_url = self.ollama_url,
            verbose = self.verbose,
            quiet = self.quiet,
            redact = self.redact,
            redact_body = self.redact_body,
            store_chunks = self.store_chunks,
            grace = self.shutdown_grace_secs,
        )
    }

    /// Load file config if it exists
    ///
    /// A config file that exists but cannot be parsed is a fatal error -
    /// failing fast beats silently running on defaults while the user
    /// debugs the wrong thing.
    fn load_file_config() -> anyhow::Result<FileConfig> {
        let Some(path) = Self::config_path() else {
            return Ok(FileConfig::default());
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| {
                anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => Err(anyhow::anyhow!(
                "cannot read config file {}: {}",
                path.display(),
                e
            )),
        }
    }

    /// Load configuration: env > file > defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let file = Self::load_file_config()?;
        let defaults = Self::default();

        Ok(Self {
            host: env_str("INTERCEPTOR_HOST")
                .or(file.host)
                .unwrap_or(defaults.host),
            port: env_parse("INTERCEPTOR_PORT")?
                .or(file.port)
                .unwrap_or(defaults.port),
            db_path: env_str("INTERCEPTOR_DB_PATH")
                .or(file.db_path)
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            openai_url: env_str("INTERCEPTOR_OPENAI_URL")
                .or(file.openai_url)
                .unwrap_or(defaults.openai_url),
            anthropic_url: env_str("INTERCEPTOR_ANTHROPIC_URL")
                .or(file.anthropic_url)
                .unwrap_or(defaults.anthropic_url),
            ollama_url: env_str("INTERCEPTOR_OLLAMA_URL")
                .or(file.ollama_url)
                .unwrap_or(defaults.ollama_url),
            verbose: env_bool("INTERCEPTOR_VERBOSE")
                .or(file.verbose)
                .unwrap_or(defaults.verbose),
            quiet: env_bool("INTERCEPTOR_QUIET")
                .or(file.quiet)
                .unwrap_or(defaults.quiet),
            redact: env_bool("INTERCEPTOR_REDACT")
                .or(file.redact)
                .unwrap_or(defaults.redact),
            redact_body: env_bool("INTERCEPTOR_REDACT_BODY")
                .or(file.redact_body)
                .unwrap_or(defaults.redact_body),
            store_chunks: env_bool("INTERCEPTOR_STORE_CHUNKS")
                .or(file.store_chunks)
                .unwrap_or(defaults.store_chunks),
            shutdown_grace_secs: env_parse("INTERCEPTOR_SHUTDOWN_GRACE_SECS")?
                .or(file.shutdown_grace_secs)
                .unwrap_or(defaults.shutdown_grace_secs),
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_str(key) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provider;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert!(config.redact);
        assert!(config.store_chunks);
        assert!(!config.redact_body);
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn upstreams_by_provider() {
        let config = Config::default();
        assert_eq!(
            config.upstream_url(Provider::Anthropic),
            "https://api.anthropic.com"
        );
        assert_eq!(
            config.upstream_url(Provider::OpenAi),
            "https://api.openai.com"
        );
        assert_eq!(
            config.upstream_url(Provider::Ollama),
            "http://localhost:11434"
        );
        assert_eq!(
            config.upstream_url(Provider::Passthrough),
            "https://api.openai.com"
        );
    }

    #[test]
    fn toml_template_roundtrips() {
        let rendered = Config::default().to_toml();
        let parsed: FileConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.port, Some(8080));
        assert_eq!(parsed.redact, Some(true));
        assert_eq!(parsed.ollama_url.as_deref(), Some("http://localhost:11434"));
    }
}
