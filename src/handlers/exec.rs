//! # Subprocess handler.
//!
//! Runs a command per delivery:
//! - the body is written to the child's stdin;
//! - the message metadata is passed as environment (see [`ExecutionContext::env`]);
//! - stdout is captured when the message expects a reply (`reply_to` set) or
//!   when capture is forced, otherwise inherited; stderr is always inherited.
//!
//! Exit status 0 ⇒ `Success(stdout)`; non-zero ⇒ `HandlerFailure`; a command
//! that cannot be spawned ⇒ `TransportFailure`; a timeout kills the child and
//! reports a `HandlerFailure`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::dispatch::{DispatchOutcome, ExecutionContext};

use super::Handler;

/// Executes a command for each delivery.
#[derive(Clone, Debug)]
pub struct ExecHandler {
    program: PathBuf,
    args: Vec<String>,
    clean_env: bool,
    capture: bool,
    timeout: Option<Duration>,
    name: String,
}

impl ExecHandler {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        let name = program.display().to_string();
        Self {
            program,
            args,
            clean_env: false,
            capture: false,
            timeout: None,
            name,
        }
    }

    /// Starts the child with only the message environment (no inherited variables).
    pub fn clean_env(mut self, on: bool) -> Self {
        self.clean_env = on;
        self
    }

    /// Always captures stdout, even without `reply_to`.
    pub fn capture_output(mut self, on: bool) -> Self {
        self.capture = on;
        self
    }

    /// Kills the child after `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, ctx: &ExecutionContext, body: &[u8]) -> DispatchOutcome {
        let capture = self.capture || ctx.reply_to().is_some();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(if capture { Stdio::piped() } else { Stdio::inherit() })
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if self.clean_env {
            cmd.env_clear();
        }
        cmd.envs(ctx.env());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return DispatchOutcome::transport(format!("spawn {}: {e}", self.name)),
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let body = body.to_vec();

        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading its input is not an error.
                if let Err(e) = stdin.write_all(&body).await {
                    debug!(err = %e, "stdin closed early");
                }
            }
        };
        let collect = async move {
            let mut out = Vec::new();
            if let Some(mut stdout) = stdout {
                if let Err(e) = stdout.read_to_end(&mut out).await {
                    warn!(err = %e, "reading child stdout");
                }
            }
            out
        };

        let work = async {
            let ((), out) = tokio::join!(feed, collect);
            (child.wait().await, out)
        };

        let (status, output) = match self.timeout {
            None => work.await,
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(done) => done,
                Err(_) => {
                    return DispatchOutcome::failure(format!("timed out after {limit:?}"), Vec::new());
                }
            },
        };

        match status {
            Ok(status) if status.success() => DispatchOutcome::Success(output),
            Ok(status) => DispatchOutcome::failure(status.to_string(), output),
            Err(e) => DispatchOutcome::transport(format!("wait {}: {e}", self.name)),
        }
    }
}

#[async_trait]
impl Handler for ExecHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &ExecutionContext, body: &[u8]) -> DispatchOutcome {
        self.run(ctx, body).await
    }
}
