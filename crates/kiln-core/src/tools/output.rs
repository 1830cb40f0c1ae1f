//! Structured tool output envelope.
//!
//! Success serializes as `{"ok": true, "data": ...}`, failure as
//! `{"ok": false, "error": {"code", "message", "details"?}}`.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Success { ok: bool, data: Value },
    Failure { ok: bool, error: ToolError },
}

/// Error details for failed tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        ToolOutput::Success { ok: true, data }
    }

    pub fn failure(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        ToolOutput::Failure {
            ok: false,
            error: ToolError {
                code: code.into(),
                message: message.into(),
                details,
            },
        }
    }

    pub fn failure_with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::failure(code, message, Some(details.into()))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { data, .. } => Some(data),
            ToolOutput::Failure { .. } => None,
        }
    }

    /// Returns the error code, message and details if this is a failure.
    pub fn error_info(&self) -> Option<(&str, &str, Option<&str>)> {
        match self {
            ToolOutput::Failure { error, .. } => Some((
                error.code.as_str(),
                error.message.as_str(),
                error.details.as_deref(),
            )),
            ToolOutput::Success { .. } => None,
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"ok":false,"error":{"code":"serialize_error","message":"Failed to serialize tool output"}}"#.to_string()
        })
    }

    /// Converts the envelope into a task outcome: data on success, the
    /// error message (plus details) on failure.
    ///
    /// # Errors
    /// Returns the tool's failure as an error.
    pub fn into_result(self) -> anyhow::Result<Value> {
        match self {
            ToolOutput::Success { data, .. } => Ok(data),
            ToolOutput::Failure { error, .. } => Err(match error.details {
                Some(details) => anyhow!("{} ({})", error.message, details),
                None => anyhow!("{}", error.message),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let ok = serde_json::to_value(ToolOutput::success(json!({"n": 1}))).unwrap();
        assert_eq!(ok, json!({"ok": true, "data": {"n": 1}}));

        let err = serde_json::to_value(ToolOutput::failure("bad", "went wrong", None)).unwrap();
        assert_eq!(
            err,
            json!({"ok": false, "error": {"code": "bad", "message": "went wrong"}})
        );
    }

    #[test]
    fn test_failure_parses_back() {
        let parsed: ToolOutput = serde_json::from_str(
            r#"{"ok":false,"error":{"code":"c","message":"m","details":"d"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.error_info(), Some(("c", "m", Some("d"))));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(
            ToolOutput::success(json!(3)).into_result().unwrap(),
            json!(3)
        );
        let err = ToolOutput::failure_with_details("x", "nope", "because")
            .into_result()
            .unwrap_err();
        assert_eq!(err.to_string(), "nope (because)");
    }
}
