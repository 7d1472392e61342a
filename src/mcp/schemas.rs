use rust_mcp_schema::Tool;
use serde_json::{json, Map, Value};

/// One callable tool: its name, a description for the model, and the JSON schema of its arguments.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_mcp_tool(&self) -> Result<Tool, serde_json::Error> {
        serde_json::from_value(json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.parameters,
        }))
    }

    /// OpenAI function-calling form: `{"type": "function", "function": {...}}`.
    pub fn to_openai_function(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

fn create_prop(type_str: &str, description: &str) -> Value {
    json!({
        "type": type_str,
        "description": description
    })
}

fn create_prop_with_default_num(type_str: &str, description: &str, default_val: f64) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "default": default_val
    })
}

fn create_prop_with_default_int(type_str: &str, description: &str, default_val: usize) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "default": default_val
    })
}

fn object_schema(required: &[&str], properties: Vec<(&str, Value)>) -> Value {
    let properties: Map<String, Value> = properties
        .into_iter()
        .map(|(name, schema)| (name.to_string(), schema))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

const TERMINAL_ID_GUIDANCE: &str = "ID of the terminal returned by create_terminal.";
const WAIT_TIMEOUT_GUIDANCE: &str = "Maximum seconds to wait for output. Reading also stops after 3 seconds without new output. Default 30.";
const MAX_LINES_GUIDANCE: &str = "Return as soon as this many new lines are available; the rest stays for the next read. Default 1000.";

pub fn get_config_schema() -> Value {
    object_schema(&[], vec![])
}

pub fn create_terminal_schema() -> Value {
    object_schema(
        &[],
        vec![
            ("shell", create_prop("string", "Shell to run (e.g. 'bash', 'powershell'). Uses the server's default shell if not set.")),
            ("workdir", create_prop("string", "Working directory. Absolute, tilde-expanded or relative to FILES_ROOT. Defaults to FILES_ROOT.")),
            ("env", json!({
                "type": "object",
                "additionalProperties": { "type": "string" },
                "description": "Extra environment variables. They override inherited variables of the same name."
            })),
            ("description", create_prop("string", "Free-form note shown by list_terminals.")),
            ("initial_command", create_prop("string", "Command written to the terminal right after it starts.")),
        ],
    )
}

pub fn terminal_input_schema() -> Value {
    object_schema(
        &["terminal_id", "input"],
        vec![
            ("terminal_id", create_prop("string", TERMINAL_ID_GUIDANCE)),
            ("input", create_prop("string", "Text to send. A newline is appended.")),
            ("wait_timeout", create_prop_with_default_num("number", WAIT_TIMEOUT_GUIDANCE, 30.0)),
            ("max_lines", create_prop_with_default_int("integer", MAX_LINES_GUIDANCE, 1000)),
        ],
    )
}

pub fn read_terminal_output_schema() -> Value {
    object_schema(
        &["terminal_id"],
        vec![
            ("terminal_id", create_prop("string", TERMINAL_ID_GUIDANCE)),
            ("wait_timeout", create_prop_with_default_num("number", WAIT_TIMEOUT_GUIDANCE, 30.0)),
            ("max_lines", create_prop_with_default_int("integer", MAX_LINES_GUIDANCE, 1000)),
        ],
    )
}

pub fn close_terminal_schema() -> Value {
    object_schema(&["terminal_id"], vec![("terminal_id", create_prop("string", TERMINAL_ID_GUIDANCE))])
}

pub fn list_terminals_schema() -> Value {
    object_schema(&[], vec![])
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_config",
            description: "Get current server configuration.",
            parameters: get_config_schema(),
        },
        ToolDefinition {
            name: "create_terminal",
            description: "Start a persistent interactive shell session and return its terminal_id.",
            parameters: create_terminal_schema(),
        },
        ToolDefinition {
            name: "terminal_input",
            description: "Send a line of input to a terminal, then wait for and return its new output.",
            parameters: terminal_input_schema(),
        },
        ToolDefinition {
            name: "read_terminal_output",
            description: "Wait for and return new output from a terminal. Check has_new_output to tell progress from idle polling.",
            parameters: read_terminal_output_schema(),
        },
        ToolDefinition {
            name: "close_terminal",
            description: "Terminate a terminal session and its shell process.",
            parameters: close_terminal_schema(),
        },
        ToolDefinition {
            name: "list_terminals",
            description: "List open terminal sessions.",
            parameters: list_terminals_schema(),
        },
    ]
}

pub fn mcp_tools() -> Result<Vec<Tool>, serde_json::Error> {
    tool_definitions().iter().map(ToolDefinition::to_mcp_tool).collect()
}

/// The `tools` array of an OpenAI chat-completions request.
pub fn openai_tool_definitions() -> Value {
    Value::Array(tool_definitions().iter().map(ToolDefinition::to_openai_function).collect())
}
