//! Spawns a provider CLI as a subprocess in its own process group and turns
//! its stdout JSON lines into a stream of normalized [`StreamEvent`]s,
//! escalating `SIGTERM` → `SIGKILL` against the whole group on cancellation.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use cro_domain::cancel::CancelToken;
use cro_domain::config::WrapperConfig;
use cro_domain::error::{OrchestratorError, Result};
use cro_domain::stream::{BoxStream, StreamEvent};
use cro_domain::trace::TraceEvent;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use super::cli_a::CliAState;
use super::cli_b::CliBState;
use super::cli_c::CliCState;
use super::registry::ChildRegistry;
use super::FlavorNormalizer;

const GRACE_PERIOD: Duration = Duration::from_secs(2);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// The process environment, minus npm's injected `npm_*`/`INIT_CWD` keys and
/// any `PATH` entry pointing into a local `node_modules/.bin`, so a CLI
/// invoked from an npm script doesn't inherit its launcher's view of the
/// world.
fn sanitized_parent_env() -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| !k.starts_with("npm_") && k != "INIT_CWD")
        .collect();
    if let Some(path) = env.get("PATH") {
        let filtered = std::env::split_paths(path)
            .filter(|p| {
                let mut components = p.components().rev();
                !(components.next().map(|c| c.as_os_str() == ".bin").unwrap_or(false)
                    && components.next().map(|c| c.as_os_str() == "node_modules").unwrap_or(false))
            })
            .collect::<Vec<_>>();
        if let Ok(joined) = std::env::join_paths(filtered) {
            env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }
    }
    env
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliFlavor {
    A,
    B,
    C,
}

impl CliFlavor {
    fn label(&self) -> &'static str {
        match self {
            Self::A => "cli_a",
            Self::B => "cli_b",
            Self::C => "cli_c",
        }
    }

    fn normalizer(&self) -> Box<dyn FlavorNormalizer> {
        match self {
            Self::A => Box::new(CliAState::default()),
            Self::B => Box::new(CliBState::default()),
            Self::C => Box::new(CliCState::default()),
        }
    }
}

/// Everything needed to invoke a provider CLI for a single turn.
pub struct CliInvocation {
    pub session_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub wrapper: Option<WrapperConfig>,
}

/// Final bookkeeping a caller can read once the stream returned alongside
/// this handle has been fully drained (yielded `None`).
#[derive(Debug, Clone, Default)]
pub struct CliOutcome {
    pub aborted: bool,
    pub session_id: Option<String>,
    pub accumulated_text: String,
}

/// Shared, updated-in-place view of a running CLI invocation's outcome.
#[derive(Clone)]
pub struct CliOutcomeHandle(Arc<Mutex<CliOutcome>>);

impl CliOutcomeHandle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(CliOutcome::default())))
    }

    /// Snapshot of the outcome as of now. Only meaningful once the paired
    /// stream has been fully drained.
    pub fn snapshot(&self) -> CliOutcome {
        self.0.lock().clone()
    }
}

/// Spawns `invocation` under flavor `flavor`'s wire protocol and returns a
/// stream of normalized events paired with a handle exposing the CLI's
/// reported session id and accumulated text once the stream is drained. The
/// child runs in a fresh process group; when `cancel` is observed, `SIGTERM`
/// is sent to the group, followed by `SIGKILL` after a grace period if the
/// group has not exited.
pub async fn read_cli_stream(
    flavor: CliFlavor,
    invocation: CliInvocation,
    cancel: CancelToken,
    registry: Arc<ChildRegistry>,
) -> Result<(BoxStream<'static, Result<StreamEvent>>, CliOutcomeHandle)> {
    let (program, args, wrapper_env) = match &invocation.wrapper {
        Some(wrapper) => {
            let mut wrapped_args = vec![invocation.program.clone()];
            wrapped_args.extend(invocation.args.clone());
            (wrapper.path.clone(), wrapped_args, wrapper.env.clone())
        }
        None => (invocation.program.clone(), invocation.args.clone(), HashMap::new()),
    };

    let mut env = sanitized_parent_env();
    env.extend(invocation.env.clone());
    env.extend(wrapper_env);

    let mut command = Command::new(&program);
    command
        .args(&args)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &invocation.cwd {
        command.current_dir(cwd);
    }
    // SAFETY: setsid() is async-signal-safe and is the only call made in the
    // child between fork and exec.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| OrchestratorError::SpawnFailed(e.to_string()))?;
    let pid = child.id().map(|p| p as i32);
    let registry_id = Uuid::new_v4();
    if let Some(pgid) = pid {
        registry.register(registry_id, pgid);
    }
    TraceEvent::CliSpawned {
        session_id: invocation.session_id.clone(),
        flavor: flavor.label().to_string(),
        pid,
    }
    .emit();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OrchestratorError::SpawnFailed("child has no stdout".into()))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut normalizer = flavor.normalizer();
    let session_id = invocation.session_id;
    let outcome = CliOutcomeHandle::new();
    let outcome_inner = outcome.clone();

    let output = stream! {
        let mut escalated = false;
        let mut accumulated_text = String::new();
        loop {
            if !escalated && cancel.is_cancelled() {
                escalated = true;
                for (call_id, tool_name) in normalizer.active_tool_calls() {
                    yield Ok(StreamEvent::ToolResult {
                        call_id,
                        tool_name,
                        ok: false,
                        result: serde_json::Value::Null,
                        error: Some((
                            "tool_interrupted".to_string(),
                            "Tool call was interrupted by cancellation".to_string(),
                        )),
                    });
                }
                if let Some(pgid) = pid {
                    let _ = signal::killpg(Pid::from_raw(pgid), Signal::SIGTERM);
                    tokio::time::sleep(GRACE_PERIOD).await;
                    let still_alive = matches!(child.try_wait(), Ok(None));
                    if still_alive {
                        let _ = signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL);
                    }
                    TraceEvent::CliKilled {
                        session_id: session_id.clone(),
                        pid,
                        escalated_to_sigkill: still_alive,
                    }
                    .emit();
                }
            }

            let next_line = tokio::time::timeout(CANCEL_POLL_INTERVAL, lines.next_line()).await;
            let line = match next_line {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    yield Err(OrchestratorError::Io(e));
                    break;
                }
                Err(_) => continue,
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) => {
                    for event in normalizer.normalize(value) {
                        if let StreamEvent::TextDelta { ref delta, .. } = event {
                            accumulated_text.push_str(delta);
                        }
                        yield Ok(event);
                    }
                }
                Err(_) => {
                    yield Err(OrchestratorError::UnexpectedNonJson { line });
                }
            }
        }

        let status = child.wait().await;
        registry.remove(&registry_id);
        let aborted = cancel.is_cancelled();
        let clean_exit = matches!(&status, Ok(s) if s.success());
        if let Ok(status) = status {
            if !status.success() && !aborted {
                yield Err(OrchestratorError::CliExitNonzero {
                    code: status.code().unwrap_or(-1),
                });
            }
        }

        if clean_exit && flavor == CliFlavor::B {
            if let Some(sid) = normalizer.session_id() {
                super::cli_b::rewrite_session_transcript_source(&sid);
            }
        }

        *outcome_inner.0.lock() = CliOutcome {
            aborted,
            session_id: normalizer.session_id(),
            accumulated_text,
        };
    };

    Ok((Box::pin(output), outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_env_drops_npm_keys_and_bin_path_entries() {
        std::env::set_var("npm_config_registry", "https://example.invalid");
        std::env::set_var("INIT_CWD", "/some/project");
        std::env::set_var(
            "PATH",
            format!(
                "/usr/bin:{}:/usr/local/bin",
                std::env::join_paths(["/some/project/node_modules/.bin"]).unwrap().to_string_lossy()
            ),
        );

        let env = sanitized_parent_env();

        assert!(!env.contains_key("npm_config_registry"));
        assert!(!env.contains_key("INIT_CWD"));
        let path = env.get("PATH").unwrap();
        assert!(!path.contains("node_modules"));
        assert!(path.contains("/usr/bin"));
        assert!(path.contains("/usr/local/bin"));

        std::env::remove_var("npm_config_registry");
        std::env::remove_var("INIT_CWD");
    }
}
