//! Process spawning capability.
//!
//! The engine only sees a [`ProcessLauncher`]: it hands over a command line and
//! gets back the two output streams and a handle to wait on. [`ShellLauncher`]
//! runs the line through the platform shell.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::warn;

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Handle on a spawned process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for the process to exit and return its exit code.
    ///
    /// A process terminated without an exit code (e.g. by a signal) reports `-1`.
    async fn wait(&mut self) -> io::Result<i32>;
}

pub struct SpawnedProcess {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub handle: Box<dyn ProcessHandle>,
}

pub trait ProcessLauncher: Send + Sync + std::fmt::Debug {
    /// Start `command_line`. Errors here mean nothing was started.
    fn spawn(&self, command_line: &str) -> io::Result<SpawnedProcess>;
}

#[derive(Debug, Clone)]
pub struct ShellLauncher {
    program: String,
    args: Vec<String>,
}

impl ShellLauncher {
    /// `shell` is the interpreter plus its leading arguments, e.g. `["sh", "-c"]`.
    /// An empty slice selects the platform default.
    pub fn new(shell: &[String]) -> Self {
        match shell.split_first() {
            Some((program, args)) => Self {
                program: program.clone(),
                args: args.to_vec(),
            },
            None => Self::default(),
        }
    }

    pub fn default_shell() -> Vec<String> {
        if cfg!(windows) {
            vec!["cmd".to_string(), "/C".to_string()]
        } else {
            vec!["sh".to_string(), "-c".to_string()]
        }
    }
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self::new(&Self::default_shell())
    }
}

impl ProcessLauncher for ShellLauncher {
    fn spawn(&self, command_line: &str) -> io::Result<SpawnedProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so a terminal interrupt aimed at us does not hit the child.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let (stdout, stderr) = take_pipes(&mut child)?;

        Ok(SpawnedProcess {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(ChildHandle(child)),
        })
    }
}

/// Take both output pipes, killing the child if either is missing.
fn take_pipes(child: &mut Child) -> io::Result<(ChildStdout, ChildStderr)> {
    match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => Ok((stdout, stderr)),
        _ => {
            if let Err(err) = child.start_kill() {
                warn!(error = %err, "Failed to kill child without output pipes");
            }
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "output pipes unavailable",
            ))
        }
    }
}

struct ChildHandle(Child);

#[async_trait]
impl ProcessHandle for ChildHandle {
    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.0.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}
