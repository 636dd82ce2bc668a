//! Configuration file management for evosolve.
//!
//! Provides a TOML-based config file at `~/.config/evosolve/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use evosolve_core::llm::LlmConfig;
use evosolve_core::queue::auth::DispatchAuth;
use evosolve_db::config::DbConfig;

/// Default enricher fan-out ceiling per worker process.
pub const DEFAULT_ENRICHER_CONCURRENCY: usize = 25;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub dispatch: DispatchSection,
    pub llm: LlmSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchSection {
    /// Hex-encoded dispatch secret (64 hex chars = 32 bytes).
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LlmSection {
    pub base_url: String,
    /// Prefer `EVOSOLVE_LLM_API_KEY`; storing the key in the file is for
    /// development setups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_structured_output")]
    pub structured_output: bool,
}

fn default_structured_output() -> bool {
    true
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the evosolve config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/evosolve` or
/// `~/.config/evosolve`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("evosolve");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("evosolve")
}

/// Return the path to the evosolve config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Secret generation
// -----------------------------------------------------------------------

/// Generate a random dispatch secret: 32 random bytes, hex-encoded.
pub fn generate_dispatch_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct EvosolveConfig {
    pub db_config: DbConfig,
    pub dispatch_auth: DispatchAuth,
    pub llm_config: LlmConfig,
    /// Model used when a submission does not name one.
    pub default_model: String,
    pub enricher_concurrency: usize,
}

impl EvosolveConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `EVOSOLVE_DATABASE_URL` > file > default
    /// - Dispatch secret: `EVOSOLVE_DISPATCH_SECRET` > file > error
    /// - LLM key/base url: `EVOSOLVE_LLM_API_KEY` / `EVOSOLVE_LLM_BASE_URL`
    ///   > file > defaults
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("EVOSOLVE_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let dispatch_auth = if let Ok(secret_hex) = std::env::var("EVOSOLVE_DISPATCH_SECRET") {
            let bytes = hex::decode(&secret_hex)
                .context("EVOSOLVE_DISPATCH_SECRET env var is not valid hex")?;
            DispatchAuth::new(bytes)
        } else if let Some(ref cfg) = file_config {
            let bytes = hex::decode(&cfg.dispatch.secret)
                .context("invalid hex in config file dispatch.secret")?;
            DispatchAuth::new(bytes)
        } else {
            bail!(
                "dispatch secret not found; set EVOSOLVE_DISPATCH_SECRET or run `evosolve init` to create a config file"
            );
        };

        let api_key = std::env::var("EVOSOLVE_LLM_API_KEY")
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.llm.api_key.clone()));
        let base_url = std::env::var("EVOSOLVE_LLM_BASE_URL")
            .ok()
            .or_else(|| file_config.as_ref().map(|c| c.llm.base_url.clone()))
            .unwrap_or_else(|| LlmConfig::default().base_url);
        let structured_output = file_config
            .as_ref()
            .map(|c| c.llm.structured_output)
            .unwrap_or(true);

        let llm_config = LlmConfig {
            base_url,
            api_key,
            structured_output,
            temperature: 0.8,
            timeout: Duration::from_secs(300),
        };

        let default_model = file_config
            .as_ref()
            .map(|c| c.llm.model.clone())
            .unwrap_or_else(|| "gpt-4.1-mini".to_owned());

        let enricher_concurrency = std::env::var("EVOSOLVE_ENRICHER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ENRICHER_CONCURRENCY)
            .min(DEFAULT_ENRICHER_CONCURRENCY);

        Ok(Self {
            db_config,
            dispatch_auth,
            llm_config,
            default_model,
            enricher_concurrency,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn generate_dispatch_secret_is_64_hex_chars() {
        let secret = generate_dispatch_secret();
        assert_eq!(secret.len(), 64);
        assert!(
            secret.chars().all(|c| c.is_ascii_hexdigit()),
            "expected all hex digits, got: {secret}"
        );
    }

    #[test]
    fn generate_dispatch_secret_is_random() {
        let a = generate_dispatch_secret();
        let b = generate_dispatch_secret();
        assert_ne!(a, b, "two generated secrets should differ");
    }

    #[test]
    fn config_file_roundtrip() {
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/testdb".to_string(),
            },
            dispatch: DispatchSection {
                secret: "aa".repeat(32),
            },
            llm: LlmSection {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                model: "gpt-4.1-mini".to_string(),
                structured_output: true,
            },
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.dispatch.secret, original.dispatch.secret);
        assert_eq!(loaded.llm.model, original.llm.model);
        assert!(loaded.llm.api_key.is_none());
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();

        unsafe { std::env::set_var("EVOSOLVE_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe {
            std::env::set_var(
                "EVOSOLVE_DISPATCH_SECRET",
                "aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55",
            )
        };

        let config = EvosolveConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        unsafe { std::env::remove_var("EVOSOLVE_DATABASE_URL") };
        unsafe { std::env::remove_var("EVOSOLVE_DISPATCH_SECRET") };
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();

        unsafe { std::env::set_var("EVOSOLVE_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe {
            std::env::set_var(
                "EVOSOLVE_DISPATCH_SECRET",
                "aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55aa55",
            )
        };

        let config = EvosolveConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        unsafe { std::env::remove_var("EVOSOLVE_DATABASE_URL") };
        unsafe { std::env::remove_var("EVOSOLVE_DISPATCH_SECRET") };
    }

    #[test]
    fn resolve_errors_when_no_dispatch_secret() {
        let _lock = lock_env();

        unsafe { std::env::remove_var("EVOSOLVE_DISPATCH_SECRET") };
        // Point HOME and XDG_CONFIG_HOME at a temp dir so load_config()
        // cannot find a real config file.
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let result = EvosolveConfig::resolve(Some("postgresql://localhost:5432/evosolve"));

        // Restore env before asserting, to avoid poisoning the mutex on failure.
        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert!(result.is_err(), "should error when no dispatch secret");
        let msg = result.unwrap_err().to_string();
        assert!(
            msg.contains("dispatch secret not found"),
            "unexpected error: {msg}"
        );
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("evosolve/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
