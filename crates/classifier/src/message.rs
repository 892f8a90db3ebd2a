//! Error message extraction from upstream bodies

use serde_json::Value;

/// Decode the `error.message` of a failed upstream response.
///
/// Only structured bodies are inspected: `application/json` (an object, or an
/// array whose first element is the error object) and `text/event-stream`
/// (the first `data:` line that parses as JSON). Anything else yields `None`.
pub fn extract_message(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    let content_type = content_type?;
    if content_type.contains("application/json") {
        let value: Value = serde_json::from_slice(body).ok()?;
        return error_message(&value);
    }
    if content_type.contains("text/event-stream") {
        let text = std::str::from_utf8(body).ok()?;
        let value = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .find_map(|data| serde_json::from_str::<Value>(data.trim()).ok())?;
        return error_message(&value);
    }
    None
}

fn error_message(value: &Value) -> Option<String> {
    let value = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}
