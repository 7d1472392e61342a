use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_STRING_LEN: usize = 1024;

/// Append-only record of every tool call, rotated by size.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: &Config) -> Self {
        if let Some(parent_dir) = config.audit_log_file.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path: config.audit_log_file.clone(),
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        let metadata = match fs::metadata(&self.log_file_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self.log_file_path.file_stem().unwrap_or_default().to_string_lossy();
            let extension = self.log_file_path.extension().unwrap_or_default().to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    /// Never fails the tool call; problems are only logged.
    pub async fn log_tool_call(&self, tool_name: &str, arguments: &Map<String, Value>) {
        if let Err(e) = self.try_log_tool_call(tool_name, arguments).await {
            error!(tool = %tool_name, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_tool_call(&self, tool_name: &str, arguments: &Map<String, Value>) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        let args_string = serde_json::to_string(&sanitize_arguments(arguments))?;
        let log_entry = format!("{} | {:<20} | Arguments: {}\n", timestamp, tool_name, args_string);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        // tokio completes writes in the background; the next call's rotation check must see this one.
        file.flush().await?;
        Ok(())
    }
}

/// Masks environment values and shortens oversized terminal input.
fn sanitize_arguments(arguments: &Map<String, Value>) -> Map<String, Value> {
    let mut sanitized = arguments.clone();
    if let Some(Value::Object(env)) = sanitized.get_mut("env") {
        for value in env.values_mut() {
            *value = Value::String("***".to_string());
        }
    }
    for key in ["input", "initial_command"] {
        if let Some(value) = sanitized.get_mut(key) {
            if value.as_str().map_or(false, |s| s.len() > MAX_LOGGED_STRING_LEN) {
                *value = Value::String(format!("<{} truncated for log>", key));
            }
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn env_values_are_masked_and_long_input_truncated() {
        let sanitized = sanitize_arguments(&args(json!({
            "env": { "API_TOKEN": "secret" },
            "input": "x".repeat(MAX_LOGGED_STRING_LEN + 1),
            "initial_command": "ls",
        })));
        assert_eq!(sanitized["env"]["API_TOKEN"], "***");
        assert_eq!(sanitized["input"], "<input truncated for log>");
        assert_eq!(sanitized["initial_command"], "ls");
    }

    #[tokio::test]
    async fn appends_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().to_path_buf());
        config.audit_log_file = dir.path().join("logs").join("tool_calls.log");
        let logger = AuditLogger::new(&config);

        logger.log_tool_call("create_terminal", &args(json!({ "shell": "sh" }))).await;
        logger.log_tool_call("list_terminals", &Map::new()).await;

        let contents = std::fs::read_to_string(&config.audit_log_file).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("create_terminal"));
        assert!(lines[0].contains(r#"{"shell":"sh"}"#));
        assert!(lines[1].contains("list_terminals"));
    }

    #[tokio::test]
    async fn every_entry_is_on_disk_when_the_call_returns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().to_path_buf());
        config.audit_log_file = dir.path().join("tool_calls.log");
        let logger = AuditLogger::new(&config);

        for i in 0..25 {
            logger.log_tool_call("read_terminal_output", &args(json!({ "terminal_id": i }))).await;
            let contents = std::fs::read_to_string(&config.audit_log_file).unwrap();
            assert_eq!(contents.lines().count(), i + 1);
        }
    }

    #[tokio::test]
    async fn rotates_when_over_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().to_path_buf());
        config.audit_log_file = dir.path().join("tool_calls.log");
        config.audit_log_max_size_bytes = 10;
        let logger = AuditLogger::new(&config);

        logger.log_tool_call("list_terminals", &Map::new()).await;
        logger.log_tool_call("list_terminals", &Map::new()).await;

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
        let current = std::fs::read_to_string(&config.audit_log_file).unwrap();
        assert_eq!(current.lines().count(), 1);
    }
}
