//! The server-hook boundary: external commands run around gateway
//! events, currently before a Telnet backend connect.
//!
//! Hooks receive their parameters as environment variables under the
//! project prefix; any inherited variable already carrying that prefix
//! is stripped so a hook cannot read another session's parameters.
//! Hook stdout and stderr stream to the caller while the hook runs.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    time::timeout,
};
use tracing::debug;

/// Environment prefix for hook parameters; inherited variables with
/// this prefix are stripped from the child environment.
pub const HOOK_ENV_PREFIX: &str = "TERMWIRE_";

/// The gateway events hooks can attach to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HookType {
    /// Runs before a backend connect is attempted.
    BeforeConnecting,
}

/// Receives a running hook's output.
#[async_trait]
pub trait HookOutput: Send {
    /// Delivers a chunk of the hook's stdout.
    async fn out(&mut self, b: &[u8]) -> io::Result<()>;

    /// Delivers a chunk of the hook's stderr.
    async fn err(&mut self, b: &[u8]) -> io::Result<()>;
}

/// Runs the hooks registered for each [`HookType`], in registration
/// order.
#[derive(Debug, Default)]
pub struct HookRunner {
    hooks: HashMap<HookType, Vec<ExecHook>>,
    timeout: Duration,
}

impl HookRunner {
    /// A runner with no hooks registered; every run is a no-op
    /// success.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a runner from command lines per hook type.
    pub fn new(hooks: HashMap<HookType, Vec<Vec<String>>>, run_timeout: Duration) -> Self {
        Self {
            hooks: hooks
                .into_iter()
                .map(|(t, cmds)| (t, cmds.into_iter().map(ExecHook).collect()))
                .collect(),
            timeout: run_timeout,
        }
    }

    /// Whether any hook is registered for `hook_type`.
    pub fn has(&self, hook_type: HookType) -> bool {
        self.hooks.get(&hook_type).is_some_and(|h| !h.is_empty())
    }

    /// Runs every hook registered for `hook_type`.
    ///
    /// Each hook gets the given parameters plus a `Deadline` parameter
    /// (unix seconds) derived from the configured timeout. The first
    /// failing hook aborts the run.
    pub async fn run(
        &self,
        hook_type: HookType,
        params: &[(String, String)],
        output: &mut dyn HookOutput,
    ) -> io::Result<()> {
        let Some(hooks) = self.hooks.get(&hook_type) else {
            return Ok(());
        };

        let deadline = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .saturating_add(self.timeout)
            .as_secs();

        let mut all_params: Vec<(String, String)> = params.to_vec();
        all_params.push(("Deadline".to_owned(), deadline.to_string()));

        for hook in hooks {
            hook.run(self.timeout, &all_params, output).await?;
        }
        Ok(())
    }
}

/// Whether an inherited `NAME=value` environment entry may be passed
/// to a hook.
fn is_allowed_hook_env(name: &str) -> bool {
    !name.trim().to_uppercase().starts_with(HOOK_ENV_PREFIX)
}

fn parameter_env_name(name: &str) -> String {
    format!(
        "{}{}",
        HOOK_ENV_PREFIX,
        name.to_uppercase().replace(' ', "_")
    )
}

/// A hook that launches an external process.
#[derive(Clone, Debug)]
struct ExecHook(Vec<String>);

impl ExecHook {
    async fn run(
        &self,
        run_timeout: Duration,
        params: &[(String, String)],
        output: &mut dyn HookOutput,
    ) -> io::Result<()> {
        let (program, args) = self
            .0
            .split_first()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "hook command is unspecified"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(std::env::vars().filter(|(name, _)| is_allowed_hook_env(name)))
            .envs(
                params
                    .iter()
                    .map(|(name, value)| (parameter_env_name(name), value.clone())),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        debug!(hook = %program, "hook started");

        match timeout(run_timeout, stream_child(&mut child, output)).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                Err(io::Error::new(ErrorKind::TimedOut, "hook timed out"))
            }
        }
    }
}

/// Reads from the stream if still open, or parks forever so the other
/// select branch keeps the loop going.
async fn read_open<R>(stream: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match stream {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Streams the child's stdout and stderr to `output` until both close,
/// then reaps the exit status.
async fn stream_child(child: &mut Child, output: &mut dyn HookOutput) -> io::Result<()> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            n = read_open(&mut stdout, &mut out_buf) => {
                match n? {
                    0 => stdout = None,
                    n => output.out(&out_buf[..n]).await?,
                }
            }
            n = read_open(&mut stderr, &mut err_buf) => {
                match n? {
                    0 => stderr = None,
                    n => output.err(&err_buf[..n]).await?,
                }
            }
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(io::Error::new(
            ErrorKind::Other,
            format!("hook exited unsuccessfully: {}", status),
        ));
    }
    Ok(())
}
