use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

const DEFAULT_MAX_TERMINALS: usize = 10;
const DEFAULT_TERMINAL_BUFFER_LINES: usize = 1000;
const DEFAULT_TERMINAL_IDLE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_TERMINAL_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_AUDIT_LOG_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub files_root: PathBuf,
    pub allowed_directories: Vec<PathBuf>,
    pub default_shell: Option<String>,
    pub max_terminals: usize,
    pub terminal_buffer_lines: usize,
    pub terminal_idle_timeout_ms: u64,
    pub terminal_poll_interval_ms: u64,
    pub log_level: String,
    pub transport_mode: TransportMode,
    pub sse_host: String,
    pub sse_port: u16,
    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Stdio,
    Sse,
}

impl FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "sse" => Ok(TransportMode::Sse),
            _ => Err(anyhow::anyhow!("Invalid transport mode: {}", s)),
        }
    }
}

/// Shell used when neither the caller nor `DEFAULT_SHELL` names one.
pub fn default_shell_for_platform() -> &'static str {
    if cfg!(windows) {
        "powershell"
    } else {
        "bash"
    }
}

fn expand_tilde(path_str: &str) -> Result<PathBuf, anyhow::Error> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {}: {}", key, raw)),
        _ => Ok(default),
    }
}

fn non_zero<T: PartialEq + Default>(key: &str, value: T) -> Result<T> {
    if value == T::default() {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(value)
}

impl Config {
    /// A configuration rooted at `files_root` with every other setting at its default.
    pub fn new(files_root: PathBuf) -> Self {
        let audit_log_file = files_root.join(".mcp-logs").join("tool_calls.log");
        Config {
            allowed_directories: vec![files_root.clone()],
            files_root,
            default_shell: None,
            max_terminals: DEFAULT_MAX_TERMINALS,
            terminal_buffer_lines: DEFAULT_TERMINAL_BUFFER_LINES,
            terminal_idle_timeout_ms: DEFAULT_TERMINAL_IDLE_TIMEOUT_MS,
            terminal_poll_interval_ms: DEFAULT_TERMINAL_POLL_INTERVAL_MS,
            log_level: "info".to_string(),
            transport_mode: TransportMode::Stdio,
            sse_host: "127.0.0.1".to_string(),
            sse_port: 3000,
            audit_log_file,
            audit_log_max_size_bytes: DEFAULT_AUDIT_LOG_MAX_SIZE_BYTES,
        }
    }

    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let files_root_str = std::env::var("FILES_ROOT")
            .context("FILES_ROOT environment variable must be set")?;
        let files_root = dunce::canonicalize(expand_tilde(&files_root_str)?)
            .with_context(|| format!("Failed to canonicalize FILES_ROOT: {}", files_root_str))?;
        if !files_root.is_dir() {
            anyhow::bail!("FILES_ROOT is not a valid directory: {:?}", files_root);
        }

        let mut config = Config::new(files_root.clone());

        let allowed_directories_str = std::env::var("ALLOWED_DIRECTORIES").unwrap_or_default();
        if !allowed_directories_str.trim().is_empty() {
            let mut allowed_directories: Vec<PathBuf> = allowed_directories_str
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .filter_map(|s| match expand_tilde(s).and_then(|p| Ok(dunce::canonicalize(p)?)) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!(entry = %s, error = %e, "Ignoring unusable ALLOWED_DIRECTORIES entry");
                        None
                    }
                })
                .collect();
            if allowed_directories.iter().any(|dir| dir.parent().is_none()) {
                warn!("ALLOWED_DIRECTORIES grants full filesystem access ('{}'). This is highly permissive.", allowed_directories_str);
            }
            // FILES_ROOT stays reachable whatever else is listed.
            allowed_directories.push(files_root.clone());
            allowed_directories.sort();
            allowed_directories.dedup();
            config.allowed_directories = allowed_directories;
        }

        config.default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.trim().is_empty());

        config.max_terminals = non_zero("MAX_TERMINALS", env_or("MAX_TERMINALS", DEFAULT_MAX_TERMINALS)?)?;
        config.terminal_buffer_lines = non_zero(
            "TERMINAL_BUFFER_LINES",
            env_or("TERMINAL_BUFFER_LINES", DEFAULT_TERMINAL_BUFFER_LINES)?,
        )?;
        config.terminal_idle_timeout_ms = non_zero(
            "TERMINAL_IDLE_TIMEOUT_MS",
            env_or("TERMINAL_IDLE_TIMEOUT_MS", DEFAULT_TERMINAL_IDLE_TIMEOUT_MS)?,
        )?;
        config.terminal_poll_interval_ms = non_zero(
            "TERMINAL_POLL_INTERVAL_MS",
            env_or("TERMINAL_POLL_INTERVAL_MS", DEFAULT_TERMINAL_POLL_INTERVAL_MS)?,
        )?;

        config.log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let transport_mode_str = std::env::var("MCP_TRANSPORT").unwrap_or_else(|_| "stdio".to_string());
        config.transport_mode = TransportMode::from_str(&transport_mode_str)?;

        config.sse_host = std::env::var("MCP_SSE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        config.sse_port = env_or("MCP_SSE_PORT", 3000u16)?;

        let log_dir_base = std::env::var("MCP_LOG_DIR")
            .ok()
            .and_then(|s| expand_tilde(&s).ok())
            .unwrap_or_else(|| files_root.join(".mcp-logs"));
        config.audit_log_file = log_dir_base.join("tool_calls.log");
        config.audit_log_max_size_bytes = std::env::var("AUDIT_LOG_MAX_SIZE_MB")
            .ok()
            .and_then(|mb| mb.trim().parse::<u64>().ok())
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(DEFAULT_AUDIT_LOG_MAX_SIZE_BYTES);

        Ok(config)
    }

    /// Picks the shell for a new terminal: the caller's choice, then `DEFAULT_SHELL`, then the platform default.
    pub fn resolve_shell(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_shell.clone())
            .unwrap_or_else(|| default_shell_for_platform().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_matches_host_platform() {
        if cfg!(windows) {
            assert_eq!(default_shell_for_platform(), "powershell");
        } else {
            assert_eq!(default_shell_for_platform(), "bash");
        }
    }

    #[test]
    fn resolve_shell_prefers_caller_then_config() {
        let mut config = Config::new(PathBuf::from("/tmp"));
        assert_eq!(config.resolve_shell(None), default_shell_for_platform());
        assert_eq!(config.resolve_shell(Some("  ")), default_shell_for_platform());

        config.default_shell = Some("zsh".to_string());
        assert_eq!(config.resolve_shell(None), "zsh");
        assert_eq!(config.resolve_shell(Some("sh")), "sh");
    }

    #[test]
    fn new_config_uses_terminal_defaults() {
        let config = Config::new(PathBuf::from("/srv/work"));
        assert_eq!(config.max_terminals, 10);
        assert_eq!(config.terminal_buffer_lines, 1000);
        assert_eq!(config.terminal_idle_timeout_ms, 3000);
        assert_eq!(config.allowed_directories, vec![PathBuf::from("/srv/work")]);
        assert!(config.audit_log_file.ends_with(".mcp-logs/tool_calls.log"));
    }

    #[test]
    fn transport_mode_parses_case_insensitively() {
        assert_eq!(TransportMode::from_str("SSE").ok(), Some(TransportMode::Sse));
        assert!(TransportMode::from_str("websocket").is_err());
    }

    #[test]
    fn non_zero_rejects_zero() {
        assert!(non_zero("MAX_TERMINALS", 0usize).is_err());
        assert_eq!(non_zero("MAX_TERMINALS", 3usize).ok(), Some(3));
    }
}
