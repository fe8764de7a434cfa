//! The closed, named set of pure value transformations used by field
//! mappings.
//!
//! Each function is addressable by a string name; a chain is an ordered list
//! of `{name, args}` steps. If any step yields null the chain short-circuits
//! to null. Unknown names fail the mapping with
//! [`WsError::TransformUnknown`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ws_core::error::{Result, WsError};

/// One step of a transformation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformStep {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Parse the stored transformation column: either a single `{name, args}`
/// object or an array of them.
pub fn parse_chain(value: &serde_json::Value) -> Result<Vec<TransformStep>> {
    let parsed: std::result::Result<Vec<TransformStep>, _> = if value.is_array() {
        serde_json::from_value(value.clone())
    } else {
        serde_json::from_value(value.clone()).map(|step: TransformStep| vec![step])
    };
    parsed.map_err(|e| WsError::Configuration(format!("malformed transformation: {e}")))
}

/// Whether a transformation name is in the registered set.
pub fn is_known(name: &str) -> bool {
    const KNOWN: &[&str] = &[
        "identity",
        "uppercase",
        "lowercase",
        "trim",
        "to_number",
        "to_string",
        "to_boolean",
        "date_format",
        "email_to_username",
        "replace",
        "concat",
        "split",
        "truncate",
        "html_to_text",
        "text_to_html",
        "markdown_to_text",
        "extract_path_head",
        "replace_path_head",
        "azure_priority_to_servicedesk",
        "servicedesk_priority_to_azure",
    ];
    KNOWN.contains(&name)
}

/// Apply a chain to a value, expanding `$context.key` argument strings from
/// `ctx` first. Null short-circuits.
pub fn apply_chain(
    steps: &[TransformStep],
    value: serde_json::Value,
    ctx: &HashMap<String, String>,
) -> Result<serde_json::Value> {
    let mut current = value;
    for step in steps {
        if current.is_null() {
            return Ok(serde_json::Value::Null);
        }
        let args = substitute_context(&step.args, ctx);
        current = apply(&step.name, &args, current)?;
    }
    Ok(current)
}

/// Expand `$context.key` strings anywhere inside the args value.
fn substitute_context(
    args: &serde_json::Value,
    ctx: &HashMap<String, String>,
) -> serde_json::Value {
    match args {
        serde_json::Value::String(s) => {
            if let Some(key) = s.strip_prefix("$context.") {
                match ctx.get(key) {
                    Some(v) => serde_json::Value::String(v.clone()),
                    None => args.clone(),
                }
            } else {
                args.clone()
            }
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_context(v, ctx)))
                .collect(),
        ),
        serde_json::Value::Array(arr) => serde_json::Value::Array(
            arr.iter().map(|v| substitute_context(v, ctx)).collect(),
        ),
        other => other.clone(),
    }
}

/// Apply one named transformation.
pub fn apply(name: &str, args: &serde_json::Value, value: serde_json::Value) -> Result<serde_json::Value> {
    use serde_json::Value;
    let out = match name {
        "identity" => value,
        "uppercase" => map_str(value, |s| s.to_uppercase()),
        "lowercase" => map_str(value, |s| s.to_lowercase()),
        "trim" => map_str(value, |s| s.trim().to_string()),
        "to_number" => match value {
            Value::Number(n) => Value::Number(n),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Value::Bool(b) => Value::Number((b as i64).into()),
            _ => Value::Null,
        },
        "to_string" => match value {
            Value::String(s) => Value::String(s),
            Value::Null => Value::Null,
            other => Value::String(scalar_to_string(&other)),
        },
        "to_boolean" => match value {
            Value::Bool(b) => Value::Bool(b),
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            Value::String(s) => {
                let s = s.trim().to_lowercase();
                Value::Bool(matches!(s.as_str(), "true" | "yes" | "1" | "on"))
            }
            _ => Value::Null,
        },
        "date_format" => {
            let format = args.get("format").and_then(|v| v.as_str()).unwrap_or("iso");
            match parse_date(&value) {
                Some(dt) => match format {
                    "short" => Value::String(dt.format("%Y-%m-%d").to_string()),
                    _ => Value::String(dt.to_rfc3339()),
                },
                None => Value::Null,
            }
        }
        "email_to_username" => map_str(value, |s| {
            s.split('@').next().unwrap_or_default().to_string()
        }),
        "replace" => {
            let search = args.get("search").and_then(|v| v.as_str()).unwrap_or("");
            let replacement = args.get("replace").and_then(|v| v.as_str()).unwrap_or("");
            if search.is_empty() {
                value
            } else {
                map_str(value, |s| s.replace(search, replacement))
            }
        }
        "concat" => {
            let prefix = args.get("prefix").and_then(|v| v.as_str()).unwrap_or("");
            let suffix = args.get("suffix").and_then(|v| v.as_str()).unwrap_or("");
            map_str(value, |s| format!("{prefix}{s}{suffix}"))
        }
        "split" => {
            let separator = args.get("separator").and_then(|v| v.as_str()).unwrap_or(",");
            let index = args.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            match value.as_str() {
                Some(s) => s
                    .split(separator)
                    .nth(index)
                    .map(|part| Value::String(part.trim().to_string()))
                    .unwrap_or(Value::Null),
                None => Value::Null,
            }
        }
        "truncate" => {
            let length = args.get("length").and_then(|v| v.as_u64()).unwrap_or(255) as usize;
            map_str(value, |s| s.chars().take(length).collect())
        }
        "html_to_text" => map_str(value, |s| html_to_text(&s)),
        "text_to_html" => map_str(value, |s| text_to_html(&s)),
        "markdown_to_text" => map_str(value, |s| markdown_to_text(&s)),
        "extract_path_head" => map_str(value, |s| {
            s.split('\\').next().unwrap_or_default().to_string()
        }),
        "replace_path_head" => {
            let head = args.get("head").and_then(|v| v.as_str()).unwrap_or("");
            map_str(value, |s| {
                let tail: Vec<&str> = s.split('\\').skip(1).collect();
                if tail.is_empty() {
                    head.to_string()
                } else {
                    format!("{}\\{}", head, tail.join("\\"))
                }
            })
        }
        "azure_priority_to_servicedesk" => match value.as_i64() {
            Some(1) => Value::String("High".into()),
            Some(2) => Value::String("Medium".into()),
            Some(3) => Value::String("Low".into()),
            Some(_) => Value::String("Normal".into()),
            None => Value::Null,
        },
        "servicedesk_priority_to_azure" => match value.as_str() {
            Some("High") | Some("Urgent") => Value::Number(1.into()),
            Some("Medium") | Some("Normal") => Value::Number(2.into()),
            Some("Low") => Value::Number(3.into()),
            _ => Value::Null,
        },
        unknown => return Err(WsError::TransformUnknown(unknown.to_string())),
    };
    Ok(out)
}

fn map_str(value: serde_json::Value, f: impl Fn(String) -> String) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(f(s)),
        serde_json::Value::Null => serde_json::Value::Null,
        other => serde_json::Value::String(f(scalar_to_string(&other))),
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_date(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}

fn text_to_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\n', "<br>")
}

fn markdown_to_text(md: &str) -> String {
    let mut out = String::with_capacity(md.len());
    for line in md.lines() {
        let line = line.trim_start_matches('#').trim_start();
        let mut rest = line;
        // Rewrite [text](url) links to their text.
        let mut cleaned = String::new();
        while let Some(open) = rest.find('[') {
            if let Some(close) = rest[open..].find("](") {
                if let Some(end) = rest[open + close..].find(')') {
                    cleaned.push_str(&rest[..open]);
                    cleaned.push_str(&rest[open + 1..open + close]);
                    rest = &rest[open + close + end + 1..];
                    continue;
                }
            }
            break;
        }
        cleaned.push_str(rest);
        let cleaned = cleaned.replace("**", "").replace('`', "").replace('_', "");
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(cleaned.trim());
    }
    out.trim().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
