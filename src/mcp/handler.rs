use crate::mcp::dispatch::ToolDispatcher;
use crate::mcp::schemas::mcp_tools;

use async_trait::async_trait;
use rust_mcp_schema::{
    schema_utils::CallToolError, CallToolRequest, CallToolResult, ListToolsRequest, ListToolsResult, RpcError, Tool,
};
use rust_mcp_sdk::mcp_server::ServerHandler;
use rust_mcp_sdk::McpServer;
use std::sync::Arc;
use tracing::{info, instrument};

/// MCP front end of the gateway. Tool calls are forwarded to the [`ToolDispatcher`].
pub struct GatewayServerHandler {
    dispatcher: Arc<ToolDispatcher>,
    tools: Vec<Tool>,
}

impl GatewayServerHandler {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            dispatcher,
            tools: mcp_tools()?,
        })
    }
}

#[async_trait]
impl ServerHandler for GatewayServerHandler {
    #[instrument(skip(self, _request, _runtime))]
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        _runtime: &dyn McpServer,
    ) -> Result<ListToolsResult, RpcError> {
        info!("Handling list_tools request");
        Ok(ListToolsResult {
            tools: self.tools.clone(),
            meta: None,
            next_cursor: None,
        })
    }

    #[instrument(skip(self, request, _runtime), fields(tool_name = %request.params.name))]
    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        _runtime: &dyn McpServer,
    ) -> Result<CallToolResult, CallToolError> {
        info!("Handling call_tool request for: {}", request.params.name);
        let args = request.params.arguments.unwrap_or_default();
        let result = self.dispatcher.call(&request.params.name, args).await?;
        let text = serde_json::to_string_pretty(&result).map_err(CallToolError::new)?;
        Ok(CallToolResult::text_content(text, None))
    }
}
