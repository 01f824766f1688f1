//! Debug-payload redaction for provider request/response logging.
//!
//! Walks a `serde_json::Value` tree, replacing values under sensitive keys
//! with `"[redacted]"`, truncating long `data` string fields, and guarding
//! against runaway recursion (the source language's redactor defends
//! against reference cycles; `serde_json::Value` is a tree and cannot
//! cycle, so a depth cap plays the same defensive role).

use serde_json::Value;

const SENSITIVE_KEYS: &[&str] = &[
    "apikey",
    "api_key",
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "openai-api-key",
    "anthropic-api-key",
    "anthropic-oauth-token",
];

const MAX_DEPTH: usize = 64;
const DATA_TRUNCATE_AT: usize = 200;

pub fn redact_value(value: &Value) -> Value {
    redact_inner(value, 0)
}

fn redact_inner(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::String("[Circular]".to_string());
    }

    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let lower = k.to_ascii_lowercase();
                if SENSITIVE_KEYS.contains(&lower.as_str()) {
                    out.insert(k.clone(), Value::String("[redacted]".to_string()));
                    continue;
                }
                if lower == "data" {
                    if let Value::String(s) = v {
                        if s.chars().count() > DATA_TRUNCATE_AT {
                            out.insert(
                                k.clone(),
                                Value::String(format!("[base64 {} chars]", s.chars().count())),
                            );
                            continue;
                        }
                    }
                }
                out.insert(k.clone(), redact_inner(v, depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| redact_inner(v, depth + 1)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_known_sensitive_keys_case_insensitively() {
        let input = json!({
            "Authorization": "Bearer xyz",
            "x-api-key": "sk-123",
            "ANTHROPIC-API-KEY": "sk-ant-456",
            "other": "kept",
        });
        let out = redact_value(&input);
        assert_eq!(out["Authorization"], "[redacted]");
        assert_eq!(out["x-api-key"], "[redacted]");
        assert_eq!(out["ANTHROPIC-API-KEY"], "[redacted]");
        assert_eq!(out["other"], "kept");
    }

    #[test]
    fn truncates_long_data_fields() {
        let long = "a".repeat(500);
        let input = json!({"data": long});
        let out = redact_value(&input);
        assert_eq!(out["data"], "[base64 500 chars]");
    }

    #[test]
    fn keeps_short_data_fields() {
        let input = json!({"data": "short"});
        let out = redact_value(&input);
        assert_eq!(out["data"], "short");
    }

    #[test]
    fn redacts_nested_structures() {
        let input = json!({
            "headers": {"authorization": "Bearer xyz"},
            "items": [{"api_key": "k1"}, {"fine": "ok"}],
        });
        let out = redact_value(&input);
        assert_eq!(out["headers"]["authorization"], "[redacted]");
        assert_eq!(out["items"][0]["api_key"], "[redacted]");
        assert_eq!(out["items"][1]["fine"], "ok");
    }

    #[test]
    fn redaction_is_idempotent() {
        let input = json!({"authorization": "Bearer xyz", "data": "a".repeat(300)});
        let once = redact_value(&input);
        let twice = redact_value(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn deeply_nested_value_treated_as_circular() {
        let mut v = json!("leaf");
        for _ in 0..(MAX_DEPTH + 10) {
            v = json!({"nested": v});
        }
        let out = redact_value(&v);
        // Walk down until we hit the sentinel.
        let mut cur = &out;
        let mut found = false;
        for _ in 0..(MAX_DEPTH + 20) {
            if cur == &Value::String("[Circular]".to_string()) {
                found = true;
                break;
            }
            match cur.get("nested") {
                Some(next) => cur = next,
                None => break,
            }
        }
        assert!(found);
    }
}
