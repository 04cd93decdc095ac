//! Frontend tooling processes.
//!
//! Runs the synchronous install and build commands, and spawns the
//! long-running dev server as a [`ManagedChild`]. Every command runs in the
//! frontend directory with inherited stdio so its own output reaches the
//! terminal. The dev server is spawned with `kill_on_drop(true)` and, on
//! unix, as the leader of a new process group. The session still tears it
//! down explicitly through the process tree terminator so its descendants
//! go with it, and sweeps the group for anything left behind by a root that
//! exited on its own.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tracing::{info, info_span, warn, Instrument};

use super::terminator;
use crate::{AppError, Result};

/// Liveness of a managed child process.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChildState {
    /// Process is running and owned by the session.
    Running,
    /// Process exited, on its own or after a graceful signal.
    Terminated,
    /// Process or one of its descendants had to be forcefully killed.
    Killed,
}

/// The dev server process owned by a session.
///
/// The underlying [`Child`] is not reaped until termination is confirmed,
/// so its pid cannot be recycled while the session still refers to it.
#[derive(Debug)]
pub struct ManagedChild {
    child: Child,
    pid: u32,
    command: String,
    started_at: DateTime<Utc>,
    state: ChildState,
    swept: bool,
}

impl ManagedChild {
    /// Process id captured at spawn time.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Command line the process was started from.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// When the process was spawned.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current liveness state.
    #[must_use]
    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Wait for the process to exit on its own and mark it terminated.
    ///
    /// Returns the exit code, or `None` if it was ended by a signal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if waiting on the process fails.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        self.state = ChildState::Terminated;
        Ok(status.code())
    }

    /// Terminate the process and every descendant it currently has.
    ///
    /// If the root already exited on its own, whatever is left of its
    /// process group is terminated instead. Safe to call repeatedly: after
    /// the first completed call this returns `Ok(false)` without touching
    /// the OS. Returns `Ok(true)` if any process had to be forcefully killed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Termination` if a process survives the forceful
    /// kill, or `AppError::Io` if the child cannot be reaped.
    pub async fn terminate(
        &mut self,
        children_grace: Duration,
        process_grace: Duration,
    ) -> Result<bool> {
        if self.swept {
            return Ok(false);
        }

        let mut killed = false;
        if self.state == ChildState::Running {
            if let Some(status) = self.child.try_wait()? {
                info!(pid = self.pid, ?status, "dev server had already exited");
                self.state = ChildState::Terminated;
            } else {
                killed = self.terminate_root(children_grace, process_grace).await?;
            }
        }

        killed |= self.sweep_group(children_grace).await?;
        self.swept = true;
        Ok(killed)
    }

    async fn terminate_root(
        &mut self,
        children_grace: Duration,
        process_grace: Duration,
    ) -> Result<bool> {
        let killed = terminator::terminate_tree(self.pid, children_grace, process_grace).await?;

        // The root is a zombie now; reaping it cannot block for long.
        match tokio::time::timeout(terminator::KILL_CONFIRM_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => info!(pid = self.pid, ?status, killed, "dev server reaped"),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(AppError::Termination(format!(
                    "dev server pid {} could not be reaped after termination",
                    self.pid
                )))
            }
        }

        self.state = if killed {
            ChildState::Killed
        } else {
            ChildState::Terminated
        };
        Ok(killed)
    }

    #[cfg(unix)]
    async fn sweep_group(&mut self, grace: Duration) -> Result<bool> {
        let killed = terminator::terminate_group(self.pid, grace).await?;
        if killed {
            self.state = ChildState::Killed;
        }
        Ok(killed)
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_async)]
    async fn sweep_group(&mut self, _grace: Duration) -> Result<bool> {
        Ok(false)
    }
}

/// Split a configured command line into program and arguments.
///
/// # Errors
///
/// Returns `AppError::Config` if the line is empty or has unbalanced quotes.
pub fn parse_command(command_line: &str) -> Result<Command> {
    let parts = shlex::split(command_line).unwrap_or_default();
    let Some((program, args)) = parts.split_first() else {
        return Err(AppError::Config(format!(
            "invalid command line {command_line:?}"
        )));
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run a tooling command to completion in `cwd`.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the command cannot be started, or
/// `AppError::Subprocess` naming `step` if it exits unsuccessfully.
pub async fn run_command(step: &str, command_line: &str, cwd: &Path) -> Result<()> {
    let span = info_span!("run_command", step, command = command_line);
    async {
        let mut cmd = parse_command(command_line)?;
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!(cwd = %cwd.display(), "running frontend command");
        let status = cmd
            .status()
            .await
            .map_err(|err| AppError::Spawn(format!("failed to start `{command_line}`: {err}")))?;

        if status.success() {
            info!("frontend command finished");
            Ok(())
        } else {
            warn!(code = ?status.code(), "frontend command failed");
            Err(AppError::Subprocess {
                step: step.to_owned(),
                command: command_line.to_owned(),
                code: status.code(),
            })
        }
    }
    .instrument(span)
    .await
}

/// Spawn the long-running dev server in `cwd`.
///
/// Returns as soon as the process has started; readiness is checked
/// separately.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the process cannot be started.
pub fn spawn_dev_server(command_line: &str, cwd: &Path) -> Result<ManagedChild> {
    let mut cmd = parse_command(command_line)?;
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to start `{command_line}`: {err}")))?;
    let pid = child
        .id()
        .ok_or_else(|| AppError::Spawn(format!("`{command_line}` exited before reporting a pid")))?;

    info!(pid, command = command_line, cwd = %cwd.display(), "dev server spawned");

    Ok(ManagedChild {
        child,
        pid,
        command: command_line.to_owned(),
        started_at: Utc::now(),
        state: ChildState::Running,
        swept: false,
    })
}
