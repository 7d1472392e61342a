use crate::config::Config;
use crate::error::AppError;
use crate::tools::terminal_tool::{
    CloseTerminalParams, CreateTerminalParams, ReadTerminalOutputParams, TerminalInputParams, TerminalManager,
};
use crate::utils::audit_logger::AuditLogger;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Turns a tool name plus JSON arguments into a manager call and a JSON result.
#[derive(Debug)]
pub struct ToolDispatcher {
    config: Arc<Config>,
    terminal_manager: Arc<TerminalManager>,
    audit_logger: AuditLogger,
}

impl ToolDispatcher {
    pub fn new(config: Arc<Config>, terminal_manager: Arc<TerminalManager>) -> Self {
        let audit_logger = AuditLogger::new(&config);
        Self {
            config,
            terminal_manager,
            audit_logger,
        }
    }

    pub fn terminal_manager(&self) -> &Arc<TerminalManager> {
        &self.terminal_manager
    }

    #[instrument(skip(self, args), fields(tool_name = %name))]
    pub async fn call(&self, name: &str, args: Map<String, Value>) -> Result<Value, AppError> {
        self.audit_logger.log_tool_call(name, &args).await;

        macro_rules! handle_tool {
            ($method:ident :: <$param_type:ty>) => {{
                let params: $param_type = serde_json::from_value(Value::Object(args))
                    .map_err(|e| AppError::InvalidInputArgument(format!("{}: {}", name, e)))?;
                let result = self.terminal_manager.$method(&params).await?;
                serde_json::to_value(result)?
            }};
            ($method:ident ()) => {{
                let result = self.terminal_manager.$method().await?;
                serde_json::to_value(result)?
            }};
        }

        let value = match name {
            "get_config" => serde_json::to_value(self.config.as_ref())?,
            "create_terminal" => handle_tool!(create_terminal::<CreateTerminalParams>),
            "terminal_input" => handle_tool!(send_input::<TerminalInputParams>),
            "read_terminal_output" => handle_tool!(read_output::<ReadTerminalOutputParams>),
            "close_terminal" => handle_tool!(close_terminal::<CloseTerminalParams>),
            "list_terminals" => handle_tool!(list_terminals()),
            _ => {
                error!("Unknown tool called: {}", name);
                return Err(AppError::UnknownTool(name.to_string()));
            }
        };
        debug!("Tool call completed");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn dispatcher() -> (TempDir, ToolDispatcher) {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::new(dunce::canonicalize(root.path()).unwrap());
        config.terminal_idle_timeout_ms = 200;
        config.terminal_poll_interval_ms = 20;
        config.audit_log_file = config.files_root.join("audit.log");
        let config = Arc::new(config);
        let manager = Arc::new(TerminalManager::new(config.clone()));
        (root, ToolDispatcher::new(config, manager))
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn unknown_tools_are_rejected() {
        let (_root, dispatcher) = dispatcher();
        let err = dispatcher.call("browser_click", Map::new()).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownTool(ref name) if name == "browser_click"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_invalid_input() {
        let (_root, dispatcher) = dispatcher();
        let err = dispatcher.call("terminal_input", args(json!({ "input": "ls" }))).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInputArgument(_)));
    }

    #[tokio::test]
    async fn get_config_reports_limits() {
        let (_root, dispatcher) = dispatcher();
        let config = dispatcher.call("get_config", Map::new()).await.unwrap();
        assert_eq!(config["max_terminals"], 10);
        assert_eq!(config["transport_mode"], "stdio");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminal_round_trip_through_tool_names() {
        let (root, dispatcher) = dispatcher();

        let created = dispatcher
            .call("create_terminal", args(json!({ "shell": "sh", "description": "dispatch" })))
            .await
            .unwrap();
        let terminal_id = created["terminal_id"].as_str().unwrap().to_string();

        let listed = dispatcher.call("list_terminals", Map::new()).await.unwrap();
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["terminals"][0]["description"], "dispatch");

        let output = dispatcher
            .call(
                "terminal_input",
                args(json!({ "terminal_id": terminal_id, "input": "echo via-dispatch", "wait_timeout": 5 })),
            )
            .await
            .unwrap();
        assert_eq!(output["output"], "via-dispatch");
        assert_eq!(output["has_new_output"], true);
        assert_eq!(output["no_new_output_timeout"], true);
        assert!(output.get("truncated").is_none());

        let closed = dispatcher
            .call("close_terminal", args(json!({ "terminal_id": terminal_id })))
            .await
            .unwrap();
        assert_eq!(closed, json!({ "success": true }));

        let audit = std::fs::read_to_string(root.path().join("audit.log")).unwrap();
        assert_eq!(audit.lines().count(), 4);
    }
}
