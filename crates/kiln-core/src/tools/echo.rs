//! Echo tool: returns its input unchanged. Handy for checking the
//! dispatch path end to end without side effects.

use serde_json::{Value, json};

use super::{ToolDefinition, ToolOutput};

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "echo".to_string(),
        description: "Return the input payload unchanged.".to_string(),
        input_schema: json!({}),
    }
}

pub fn execute(input: &Value) -> ToolOutput {
    ToolOutput::success(input.clone())
}
