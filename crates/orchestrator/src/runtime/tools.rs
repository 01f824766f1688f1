//! Scoped tool host: builds the tool definitions exposed to the model and
//! dispatches individual calls, enforcing the agent's [`ToolPolicy`] and a
//! per-session rate limit.
//!
//! Only a small built-in set exists here — enough to exercise the
//! tool-call iteration loop end to end (`shell`, plus a
//! `request_interaction` tool that exercises the timeout/attempt contract
//! shared with webhook delivery). A production deployment would route
//! most calls to connected capability providers; that routing layer is an
//! external collaborator here.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use cro_domain::cancel::CancelToken;
use cro_domain::config::ToolPolicy;
use cro_domain::error::OrchestratorError;
use cro_domain::tool::ToolDefinition;
use parking_lot::Mutex;
use serde_json::Value;

/// Result of invoking a tool: `ok` mirrors the wire contract's explicit
/// `ok` field; `result`/`error` are mutually exclusive by convention.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorBody>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolErrorBody {
    pub code: String,
    pub message: String,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self { ok: true, result: Some(result), error: None }
    }
    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ToolErrorBody { code: code.into(), message: message.into() }),
        }
    }
}

pub fn build_tool_definitions(tool_policy: Option<&ToolPolicy>) -> Vec<ToolDefinition> {
    let mut defs = vec![
        ToolDefinition {
            name: "shell".into(),
            description: "Run a shell command and return its combined stdout/stderr.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" }
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: "request_interaction".into(),
            description: "Ask the user a question and wait for a response, subject to a timeout.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string" },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["prompt"]
            }),
        },
    ];

    if let Some(policy) = tool_policy {
        defs.retain(|d| policy.allows(&d.name));
    }
    defs
}

/// Per-session tool-call rate limiter: a fixed token bucket refilled once
/// per window. Denying a call is not fatal — it becomes a `tool_result`
/// with `ok:false`.
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, (u32, std::time::Instant)>>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self { max_per_window, window, buckets: Mutex::new(HashMap::new()) }
    }

    /// Returns true if the call is allowed and consumes one token.
    pub fn allow(&self, session_id: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let now = std::time::Instant::now();
        let entry = buckets
            .entry(session_id.to_owned())
            .or_insert((0, now));
        if now.duration_since(entry.1) > self.window {
            *entry = (0, now);
        }
        if entry.0 >= self.max_per_window {
            return false;
        }
        entry.0 += 1;
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        // Generous default: rate limiting exists to bound runaway tool
        // loops, not to throttle normal use.
        Self::new(60, Duration::from_secs(60))
    }
}

/// Everything a tool invocation needs: correlation ids, the turn's cancel
/// signal, and an `on_update` callback the Stream Handler wires to emit
/// `tool_output_chunk` with cumulative offsets.
pub struct ToolContext<'a> {
    pub session_id: String,
    pub turn_id: String,
    pub call_id: String,
    pub cancel: CancelToken,
    pub on_update: Box<dyn Fn(&str) + Send + Sync + 'a>,
}

/// Dispatch a single tool call after policy/rate-limit checks have already
/// passed.
pub async fn dispatch_tool(tool_name: &str, arguments: &Value, ctx: &ToolContext<'_>) -> ToolOutcome {
    match tool_name {
        "shell" => dispatch_shell(arguments, ctx).await,
        "request_interaction" => dispatch_request_interaction(arguments, ctx).await,
        _ => ToolOutcome::err("tool_not_allowed", format!("unknown tool: {tool_name}")),
    }
}

async fn dispatch_shell(arguments: &Value, ctx: &ToolContext<'_>) -> ToolOutcome {
    let command = match arguments.get("command").and_then(|v| v.as_str()) {
        Some(c) => c,
        None => return ToolOutcome::err("tool_error", "missing required argument: command"),
    };

    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return ToolOutcome::err("tool_error", format!("spawn failed: {e}")),
    };

    use tokio::io::AsyncReadExt;
    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout).await;
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr).await;
    }
    (ctx.on_update)(&stdout);

    match child.wait().await {
        Ok(status) => ToolOutcome::ok(serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": status.code().unwrap_or(-1),
        })),
        Err(e) => ToolOutcome::err("tool_error", format!("wait failed: {e}")),
    }
}

/// Exercises the same timeout/attempt contract as webhook delivery (30s
/// default per attempt, bounded attempts, no retry once the user has
/// definitively declined) but against an in-process interaction instead
/// of an HTTP endpoint — there is no external registry wired up here, so
/// every call definitionally times out. Demonstrates the
/// `interaction_timeout`/`interaction_unavailable` error path named in
/// the error-kind table.
async fn dispatch_request_interaction(arguments: &Value, ctx: &ToolContext<'_>) -> ToolOutcome {
    let timeout_ms = arguments
        .get("timeout_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(30_000);

    let wait = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        // No interaction registry is wired into this deployment; a real
        // one would await a `UserResponse` here. We poll the cancel token
        // so an interrupted turn doesn't leave this tool hanging.
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(OrchestratorError::ToolInterrupted);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    match wait {
        Ok(Ok(never)) => never,
        Ok(Err(OrchestratorError::ToolInterrupted)) => {
            ToolOutcome::err("tool_interrupted", "Tool call was interrupted by the user")
        }
        Ok(Err(e)) => ToolOutcome::err("tool_error", e.to_string()),
        Err(_) => ToolOutcome::err("interaction_timeout", "the request timed out waiting for a response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_policy_filters_definitions() {
        let policy = ToolPolicy { allow: vec!["shell".into()], deny: vec![] };
        let defs = build_tool_definitions(Some(&policy));
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "shell");
    }

    #[test]
    fn rate_limiter_denies_after_budget_exhausted() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow("s1"));
        assert!(limiter.allow("s1"));
        assert!(!limiter.allow("s1"));
    }

    #[test]
    fn rate_limiter_tracks_sessions_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("s1"));
        assert!(limiter.allow("s2"));
    }

    #[tokio::test]
    async fn shell_dispatch_captures_stdout() {
        let ctx = ToolContext {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            call_id: "c1".into(),
            cancel: CancelToken::new(),
            on_update: Box::new(|_| {}),
        };
        let result = dispatch_shell(&serde_json::json!({"command": "echo hi"}), &ctx).await;
        assert!(result.ok);
        assert_eq!(result.result.unwrap()["stdout"], "hi\n");
    }

    #[tokio::test]
    async fn request_interaction_times_out_with_no_registry() {
        let ctx = ToolContext {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            call_id: "c1".into(),
            cancel: CancelToken::new(),
            on_update: Box::new(|_| {}),
        };
        let result = dispatch_request_interaction(&serde_json::json!({"prompt": "ok?", "timeout_ms": 20}), &ctx).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().code, "interaction_timeout");
    }

    #[tokio::test]
    async fn request_interaction_synthesizes_interrupted_on_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = ToolContext {
            session_id: "s1".into(),
            turn_id: "t1".into(),
            call_id: "c1".into(),
            cancel,
            on_update: Box::new(|_| {}),
        };
        let result = dispatch_request_interaction(&serde_json::json!({"prompt": "ok?", "timeout_ms": 5000}), &ctx).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().code, "tool_interrupted");
    }
}
