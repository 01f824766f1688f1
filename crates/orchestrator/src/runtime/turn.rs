//! Drives one turn to completion: resolves the agent's provider, iterates
//! the in-process tool-call loop or makes a single CLI invocation, and
//! hands every normalized event to the [`StreamHandler`] as it arrives.
//!
//! Preconditions — the session exists, no run is already active for it,
//! and the inbound text is non-empty — are enforced by the Session Hub
//! before [`run_turn`] is ever called; this module assumes they hold.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cro_domain::config::{AgentConfig, ChatAgentConfig};
use cro_domain::error::{OrchestratorError, Result};
use cro_domain::event::{ChatEvent, ChatEventPayload, TurnTrigger};
use cro_domain::stream::StreamEvent;
use cro_domain::tool::{Message, ToolCall};
use cro_providers::cli::{read_cli_stream, ChildRegistry, CliFlavor, CliInvocation};
use cro_providers::{read_http_stream, ChatRequest, ProviderRegistry};
use cro_sessions::{EventSink, SessionStore};
use futures_util::StreamExt;
use parking_lot::Mutex as SyncMutex;
use uuid::Uuid;

use super::active_run::ActiveRun;
use super::broadcaster::SessionBroadcaster;
use super::stream_handler::StreamHandler;
use super::tools::{self, RateLimiter, ToolContext};

/// One inbound message to run as a turn.
pub struct TurnInput {
    pub session_id: String,
    pub agent_id: String,
    pub text: String,
    pub response_id: String,
}

/// Shared collaborators a turn needs, independent of any one session.
pub struct TurnDeps {
    pub sink: Arc<EventSink>,
    pub store: Arc<SessionStore>,
    pub providers: Arc<ProviderRegistry>,
    pub cli_registry: Arc<ChildRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub http_client: reqwest::Client,
}

/// Run `input` to completion. `messages` is the in-process conversation
/// history for this session — owned by the Session Hub for the session's
/// whole lifetime, and only ever touched while that session's turn holds
/// it, so no further locking happens here. CLI-flavor agents ignore it:
/// continuity for them lives in the provider's own session/thread id.
pub async fn run_turn(
    deps: &TurnDeps,
    broadcaster: &dyn SessionBroadcaster,
    agent_cfg: &AgentConfig,
    messages: &mut Vec<Message>,
    input: TurnInput,
    run: Arc<ActiveRun>,
) -> Result<()> {
    let handler = StreamHandler::new(&run, &deps.sink, broadcaster);

    deps.sink
        .append(
            &input.session_id,
            ChatEvent::new(input.session_id.clone(), ChatEventPayload::TurnStart { trigger: TurnTrigger::User })
                .with_turn(run.turn_id.clone())
                .with_response(run.response_id.clone()),
        )
        .await?;
    deps.sink
        .append(
            &input.session_id,
            ChatEvent::new(input.session_id.clone(), ChatEventPayload::UserMessage { text: input.text.clone() })
                .with_turn(run.turn_id.clone())
                .with_response(run.response_id.clone()),
        )
        .await?;
    messages.push(Message::user(&input.text));

    let chat_cfg = match agent_cfg {
        AgentConfig::Chat(c) => c,
        AgentConfig::External { url } => {
            return run_external_turn(deps, &handler, url, &input).await;
        }
    };

    let outcome = match chat_cfg.provider {
        cro_domain::config::ProviderKind::InProcess => {
            run_in_process(deps, &handler, &input.agent_id, chat_cfg, messages, run.as_ref()).await
        }
        cro_domain::config::ProviderKind::CliA => {
            run_cli(deps, &handler, CliFlavor::A, chat_cfg, run.as_ref(), &input.text).await
        }
        cro_domain::config::ProviderKind::CliB => {
            run_cli(deps, &handler, CliFlavor::B, chat_cfg, run.as_ref(), &input.text).await
        }
        cro_domain::config::ProviderKind::CliC => {
            run_cli(deps, &handler, CliFlavor::C, chat_cfg, run.as_ref(), &input.text).await
        }
    };

    match outcome {
        Ok(Some(final_text)) => {
            messages.push(Message::assistant(&final_text));
            handler.emit_assistant_done(&final_text).await?;
            handler.emit_turn_end().await?;
            Ok(())
        }
        Ok(None) => {
            // Cancelled mid-flight: the cancel handler (Session Hub) owns
            // emitting interrupt/turn_end once it has swept active tool
            // calls, so there is nothing further to do here.
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn run_external_turn(
    deps: &TurnDeps,
    handler: &StreamHandler<'_>,
    url: &str,
    input: &TurnInput,
) -> Result<()> {
    let body = serde_json::json!({
        "session_id": input.session_id,
        "agent_id": input.agent_id,
        "text": input.text,
    });
    let result = deps.http_client.post(url).json(&body).send().await;
    match result {
        Ok(resp) if resp.status().is_success() => {
            handler.emit_turn_end().await?;
            Ok(())
        }
        Ok(resp) => {
            let code = resp.status().as_u16();
            handler
                .emit_error("provider_error", &format!("external agent returned status {code}"))
                .await?;
            handler.emit_turn_end().await?;
            Ok(())
        }
        Err(e) => {
            handler.emit_error("provider_error", &e.to_string()).await?;
            handler.emit_turn_end().await?;
            Ok(())
        }
    }
}

/// Iterate the in-process tool-call loop: send the conversation, stream
/// the reply, dispatch any tool calls the model issued, append their
/// results, and repeat until the model replies with no tool calls or the
/// configured iteration ceiling is hit.
async fn run_in_process(
    deps: &TurnDeps,
    handler: &StreamHandler<'_>,
    agent_id: &str,
    chat_cfg: &ChatAgentConfig,
    messages: &mut Vec<Message>,
    run: &ActiveRun,
) -> Result<Option<String>> {
    let provider = deps
        .providers
        .get(agent_id)
        .ok_or(OrchestratorError::OpenAiNotConfigured)?;
    let tool_defs = tools::build_tool_definitions(Some(&chat_cfg.tool_policy));
    let max_iters = chat_cfg.max_tool_iterations.max(1);
    let mut full_text = String::new();

    for iteration in 0..max_iters {
        if run.cancel.is_cancelled() {
            return Ok(None);
        }

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            model: chat_cfg.model.clone(),
            reasoning_level: chat_cfg.reasoning_level.clone(),
            ..Default::default()
        };

        let mut stream = read_http_stream(&provider, &req).await?;

        let mut iteration_text = String::new();
        let mut tc_order: Vec<String> = Vec::new();
        let mut tc_names: HashMap<String, String> = HashMap::new();
        let mut tc_args: HashMap<String, String> = HashMap::new();

        while let Some(event) = stream.next().await {
            if run.cancel.is_cancelled() {
                return Ok(None);
            }
            let event = event?;
            match &event {
                StreamEvent::TextDelta { delta, .. } => iteration_text.push_str(delta),
                StreamEvent::ToolCallStart { call_id, tool_name, .. } => {
                    tc_order.push(call_id.clone());
                    tc_names.insert(call_id.clone(), tool_name.clone());
                    tc_args.entry(call_id.clone()).or_default();
                }
                StreamEvent::ToolInputDelta { call_id, args_delta, .. } => {
                    tc_args.entry(call_id.clone()).or_default().push_str(args_delta);
                }
                _ => {}
            }
            handler.handle(&event).await?;
        }
        full_text.push_str(&iteration_text);

        if tc_order.is_empty() {
            return Ok(Some(full_text));
        }

        let tool_calls: Vec<ToolCall> = tc_order
            .iter()
            .map(|id| ToolCall {
                call_id: id.clone(),
                tool_name: tc_names.get(id).cloned().unwrap_or_default(),
                arguments: serde_json::from_str(tc_args.get(id).map(String::as_str).unwrap_or("{}"))
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();

        messages.push(Message::assistant_with_tool_calls(iteration_text, &tool_calls, None));

        if run.cancel.is_cancelled() {
            return Ok(None);
        }

        run_tool_calls(deps, handler, run, messages, &tool_calls).await?;

        if iteration + 1 == max_iters {
            handler
                .emit_error(
                    "tool_iteration_limit",
                    &format!("reached {max_iters} tool iterations without a final reply"),
                )
                .await?;
            return Err(OrchestratorError::ToolIterationLimit { max: max_iters, iterations: max_iters });
        }
    }

    Ok(Some(full_text))
}

struct ToolDispatchResult {
    call_id: String,
    tool_name: String,
    outcome: tools::ToolOutcome,
    chunks: Vec<String>,
}

/// Dispatch every tool call from one model turn concurrently, then apply
/// their results to the conversation and the event log in call order.
async fn run_tool_calls(
    deps: &TurnDeps,
    handler: &StreamHandler<'_>,
    run: &ActiveRun,
    messages: &mut Vec<Message>,
    tool_calls: &[ToolCall],
) -> Result<()> {
    let futures = tool_calls.iter().map(|tc| {
        let tc = tc.clone();
        let session_id = run.session_id.clone();
        let turn_id = run.turn_id.clone();
        let cancel = run.cancel.clone();
        let limiter = deps.rate_limiter.clone();
        async move {
            if !limiter.allow(&session_id) {
                return ToolDispatchResult {
                    call_id: tc.call_id,
                    tool_name: tc.tool_name,
                    outcome: tools::ToolOutcome::err("rate_limit_tools", "tool call rate limited"),
                    chunks: Vec::new(),
                };
            }

            let chunks = Arc::new(SyncMutex::new(Vec::new()));
            let chunks_for_update = chunks.clone();
            let ctx = ToolContext {
                session_id,
                turn_id,
                call_id: tc.call_id.clone(),
                cancel,
                on_update: Box::new(move |s: &str| chunks_for_update.lock().push(s.to_owned())),
            };
            let outcome = tools::dispatch_tool(&tc.tool_name, &tc.arguments, &ctx).await;
            let chunks = chunks.lock().clone();
            ToolDispatchResult { call_id: tc.call_id, tool_name: tc.tool_name, outcome, chunks }
        }
    });

    let results = futures_util::future::join_all(futures).await;

    for r in results {
        for chunk in &r.chunks {
            handler.emit_tool_output_chunk(&r.call_id, &r.tool_name, chunk).await?;
        }
        let ok = r.outcome.ok;
        let body = serde_json::json!({
            "ok": ok,
            "result": r.outcome.result,
            "error": r.outcome.error,
        });
        messages.push(Message::tool_result(&r.call_id, &body));

        match &r.outcome.error {
            Some(err) => {
                handler.emit_error(&err.code, &err.message).await?;
                handler.emit_tool_result_error(&r.call_id, &r.tool_name, &err.code, &err.message).await?;
            }
            None => {
                let result_value = r.outcome.result.clone().unwrap_or(serde_json::Value::Null);
                handler.emit_tool_result(&r.call_id, &r.tool_name, ok, result_value).await?;
            }
        }

        if run.output_cancelled() {
            break;
        }
    }

    Ok(())
}

/// Make a single CLI invocation for this turn, relaying its normalized
/// stream to the handler and recording any provider-native session id it
/// surfaces for the next turn's resume.
async fn run_cli(
    deps: &TurnDeps,
    handler: &StreamHandler<'_>,
    flavor: CliFlavor,
    chat_cfg: &ChatAgentConfig,
    run: &ActiveRun,
    text: &str,
) -> Result<Option<String>> {
    let existing_session = deps.store.get(&run.session_id).and_then(|e| e.provider_session_id);
    let cwd = resolve_cwd(chat_cfg);
    let invocation = build_cli_invocation(flavor, &run.session_id, text, chat_cfg, existing_session.as_deref(), cwd);

    let (mut stream, outcome_handle) =
        read_cli_stream(flavor, invocation, run.cancel.clone(), deps.cli_registry.clone()).await?;

    while let Some(event) = stream.next().await {
        let event = event?;
        if let StreamEvent::SessionInfo { session_id, .. } = &event {
            if !session_id.is_empty() {
                deps.store.set_provider_session_id(&run.session_id, session_id.clone());
            }
        }
        handler.handle(&event).await?;
    }

    let outcome = outcome_handle.snapshot();
    if let Some(sid) = outcome.session_id {
        deps.store.set_provider_session_id(&run.session_id, sid);
    }
    if outcome.aborted {
        return Ok(None);
    }
    Ok(Some(outcome.accumulated_text))
}

fn resolve_cwd(cfg: &ChatAgentConfig) -> Option<PathBuf> {
    cfg.working_dir
        .clone()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
}

fn build_cli_invocation(
    flavor: CliFlavor,
    session_id: &str,
    text: &str,
    cfg: &ChatAgentConfig,
    existing_session: Option<&str>,
    cwd: Option<PathBuf>,
) -> CliInvocation {
    let mut env = HashMap::new();
    let (program, args) = match flavor {
        CliFlavor::A => {
            let mut args = vec![
                "-p".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--include-partial-messages".to_string(),
            ];
            match existing_session {
                Some(id) => {
                    args.push("--resume".into());
                    args.push(id.to_string());
                }
                None => {
                    args.push("--session-id".into());
                    args.push(Uuid::new_v4().to_string());
                }
            }
            args.extend(cfg.extra_args.clone());
            args.push(text.to_owned());
            ("claude".to_string(), args)
        }
        CliFlavor::B => {
            // `--json` must precede the `resume` subcommand when resuming.
            let mut args = vec!["exec".to_string(), "--json".to_string()];
            if let Some(id) = existing_session {
                args.push("resume".into());
                args.push(id.to_string());
            }
            args.extend(cfg.extra_args.clone());
            args.push(text.to_owned());
            env.insert("ASSISTANT_SESSION_ID".to_string(), session_id.to_owned());
            ("codex".to_string(), args)
        }
        CliFlavor::C => {
            let mut args = vec!["--mode".to_string(), "json".to_string()];
            if let Some(id) = existing_session {
                args.push("--session".into());
                args.push(id.to_string());
                args.push("--continue".into());
            }
            args.extend(cfg.extra_args.clone());
            args.push("-p".to_string());
            args.push(text.to_owned());
            ("pi".to_string(), args)
        }
    };

    CliInvocation {
        session_id: session_id.to_owned(),
        program,
        args,
        cwd,
        env,
        wrapper: cfg.wrapper.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ChatAgentConfig {
        ChatAgentConfig {
            provider: cro_domain::config::ProviderKind::CliA,
            model: None,
            base_url: None,
            api_key: None,
            extra_headers: Default::default(),
            timeout_secs: 60,
            reasoning_level: None,
            working_dir: None,
            extra_args: vec![],
            wrapper: None,
            max_tool_iterations: 10,
            tool_policy: Default::default(),
        }
    }

    #[test]
    fn cli_a_fresh_invocation_assigns_session_id() {
        let invocation = build_cli_invocation(CliFlavor::A, "s1", "hi", &cfg(), None, None);
        assert_eq!(invocation.program, "claude");
        assert!(invocation.args.contains(&"--session-id".to_string()));
        assert!(!invocation.args.contains(&"--resume".to_string()));
        assert_eq!(invocation.args.last(), Some(&"hi".to_string()));
    }

    #[test]
    fn cli_a_resume_uses_stored_id() {
        let invocation = build_cli_invocation(CliFlavor::A, "s1", "hi", &cfg(), Some("sess-123"), None);
        let idx = invocation.args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(invocation.args[idx + 1], "sess-123");
    }

    #[test]
    fn cli_b_json_precedes_resume_subcommand() {
        let invocation = build_cli_invocation(CliFlavor::B, "s1", "hi", &cfg(), Some("th_1"), None);
        let json_idx = invocation.args.iter().position(|a| a == "--json").unwrap();
        let resume_idx = invocation.args.iter().position(|a| a == "resume").unwrap();
        assert!(json_idx < resume_idx);
        assert_eq!(invocation.args[resume_idx + 1], "th_1");
    }

    #[test]
    fn cli_b_sets_session_env_var() {
        let invocation = build_cli_invocation(CliFlavor::B, "s1", "hi", &cfg(), None, None);
        assert_eq!(invocation.env.get("ASSISTANT_SESSION_ID"), Some(&"s1".to_string()));
    }

    #[test]
    fn cli_c_continue_only_when_resuming() {
        let fresh = build_cli_invocation(CliFlavor::C, "s1", "hi", &cfg(), None, None);
        assert!(!fresh.args.contains(&"--continue".to_string()));

        let resumed = build_cli_invocation(CliFlavor::C, "s1", "hi", &cfg(), Some("pi-sess"), None);
        assert!(resumed.args.contains(&"--continue".to_string()));
        let idx = resumed.args.iter().position(|a| a == "--session").unwrap();
        assert_eq!(resumed.args[idx + 1], "pi-sess");
    }
}
