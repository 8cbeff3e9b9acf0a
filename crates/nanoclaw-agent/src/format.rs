//! Rendering of tool calls for channel notifications.

use serde_json::Value;

const MAX_VALUE_CHARS: usize = 100;
const MAX_ARGS_SHOWN: usize = 3;

/// One-line summary of a tool call, e.g. `[tool:session_manage] action=create title=Research`.
pub fn format_tool_call(name: &str, args: &Value) -> String {
    let summary = summarize_tool_args(name, args);
    if summary.is_empty() {
        format!("[tool:{}]", name)
    } else {
        format!("[tool:{}] {}", name, summary)
    }
}

fn summarize_tool_args(tool_name: &str, args: &Value) -> String {
    match tool_name {
        "message" => {
            let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let target = match (
                args.get("channel").and_then(|v| v.as_str()),
                args.get("chat_id").and_then(|v| v.as_str()),
            ) {
                (Some(c), Some(id)) => format!(" -> {}:{}", c, id),
                _ => String::new(),
            };
            format!("{}{}", clip(content), target)
        }
        _ => {
            let obj = match args.as_object() {
                Some(obj) => obj,
                None => return clip(&args.to_string()),
            };
            obj.iter()
                .filter_map(|(k, v)| scalar(v).map(|s| format!("{}={}", k, clip(&s))))
                .take(MAX_ARGS_SHOWN)
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn clip(s: &str) -> String {
    let s = s.lines().next().unwrap_or("");
    if s.chars().count() > MAX_VALUE_CHARS {
        let cut: String = s.chars().take(MAX_VALUE_CHARS).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}
