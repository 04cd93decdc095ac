//! Mode orchestrator: the install → build → run state machine.
//!
//! Prerequisites are existence-based. `build` installs first only when the
//! install marker directory is missing, and `launch` builds first only when
//! the build output directory is missing. Re-running a satisfied step is
//! always safe. A prerequisite always completes before the step that needs
//! it starts.

use std::fmt::{Display, Formatter};

use tracing::{info, info_span, warn, Instrument};

use super::readiness::{self, ReadinessTarget};
use super::spawner::{self, ManagedChild};
use crate::config::LauncherConfig;
use crate::shutdown::shutdown_signal;
use crate::{AppError, Result};

/// What a running session is serving.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunTarget {
    /// Bridge proxies to the live dev server.
    Dev,
    /// Bridge serves the production build.
    Prod,
}

/// Orchestrator state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LauncherState {
    /// Dependencies have not been installed.
    Uninstalled,
    /// Dependencies are installed but no build output exists.
    Installed,
    /// A production build exists.
    Built,
    /// The bridge is serving.
    Running(RunTarget),
    /// The session ended with this exit code.
    Exited(i32),
}

impl Display for LauncherState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninstalled => f.write_str("uninstalled"),
            Self::Installed => f.write_str("installed"),
            Self::Built => f.write_str("built"),
            Self::Running(RunTarget::Dev) => f.write_str("running(dev)"),
            Self::Running(RunTarget::Prod) => f.write_str("running(prod)"),
            Self::Exited(code) => write!(f, "exited({code})"),
        }
    }
}

/// Drives the frontend tooling through the launcher states.
#[derive(Debug)]
pub struct ModeOrchestrator<'a> {
    config: &'a LauncherConfig,
    state: LauncherState,
}

impl<'a> ModeOrchestrator<'a> {
    /// Create an orchestrator whose initial state reflects the markers on disk.
    #[must_use]
    pub fn new(config: &'a LauncherConfig) -> Self {
        let state = Self::detect_state(config);
        info!(%state, "initial launcher state");
        Self { config, state }
    }

    /// Infer the state from the install marker and build output directories.
    #[must_use]
    pub fn detect_state(config: &LauncherConfig) -> LauncherState {
        if config.build_output().is_dir() {
            LauncherState::Built
        } else if config.install_marker().is_dir() {
            LauncherState::Installed
        } else {
            LauncherState::Uninstalled
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LauncherState {
        self.state
    }

    /// Whether the dependency install marker exists.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.config.install_marker().is_dir()
    }

    /// Whether the production build output exists.
    #[must_use]
    pub fn is_built(&self) -> bool {
        self.config.build_output().is_dir()
    }

    /// Run the install command unconditionally.
    ///
    /// An existing build output is left alone, so the state stays `Built`
    /// when it was already there.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Subprocess` if the command fails, after moving to
    /// `Exited` with the command's code.
    pub async fn install(&mut self) -> Result<()> {
        info!("installing frontend dependencies");
        let result = spawner::run_command(
            "install",
            &self.config.frontend.install_command,
            &self.config.frontend.dir,
        )
        .await;
        let next = if self.is_built() {
            LauncherState::Built
        } else {
            LauncherState::Installed
        };
        self.settle(result, next)
    }

    /// Install only if the install marker is missing.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::install`] failures.
    pub async fn ensure_installed(&mut self) -> Result<()> {
        if self.is_installed() {
            info!(marker = %self.config.install_marker().display(), "dependencies already installed");
            return Ok(());
        }
        self.install().await
    }

    /// Install if needed, then run the build command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Subprocess` if installing or building fails.
    pub async fn build(&mut self) -> Result<()> {
        let span = info_span!("build");
        async {
            self.ensure_installed().await?;
            info!("building frontend");
            let result = spawner::run_command(
                "build",
                &self.config.frontend.build_command,
                &self.config.frontend.dir,
            )
            .await;
            self.settle(result, LauncherState::Built)
        }
        .instrument(span)
        .await
    }

    /// Build only if the build output is missing.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::build`] failures.
    pub async fn ensure_built(&mut self) -> Result<()> {
        if self.is_built() {
            info!(output = %self.config.build_output().display(), "build output already present");
            return Ok(());
        }
        self.build().await?;

        if self.is_built() {
            Ok(())
        } else {
            let err = AppError::Subprocess {
                step: "build".into(),
                command: self.config.frontend.build_command.clone(),
                code: None,
            };
            warn!(
                output = %self.config.build_output().display(),
                "build command succeeded but produced no output directory"
            );
            self.state = LauncherState::Exited(err.exit_code());
            Err(err)
        }
    }

    /// Make a production build available and enter `Running(Prod)`.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::ensure_built`] failures.
    pub async fn prepare_launch(&mut self) -> Result<()> {
        self.ensure_built().await?;
        self.state = LauncherState::Running(RunTarget::Prod);
        info!(state = %self.state, "production build ready");
        Ok(())
    }

    /// Install if needed, spawn the dev server, and wait until it answers.
    ///
    /// The returned child is running and reachable. If the dev server does
    /// not answer in time, or the readiness target is invalid, the child's
    /// whole process tree is terminated before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ReadinessTimeout` on timeout, `AppError::Config`
    /// for a bad readiness target, `AppError::Interrupted` on Ctrl-C or
    /// SIGTERM, or any install/spawn failure.
    pub async fn start_dev(&mut self) -> Result<ManagedChild> {
        let span = info_span!("start_dev");
        async {
            self.ensure_installed().await?;

            let url = self.config.dev_server_url();
            let target = match ReadinessTarget::new(
                &url,
                self.config.launch_timeout(),
                self.config.poll_interval(),
            ) {
                Ok(target) => target,
                Err(err) => return Err(self.fail(err)),
            };

            info!("launching frontend dev server");
            let mut child = match spawner::spawn_dev_server(
                &self.config.frontend.dev_command,
                &self.config.frontend.dir,
            ) {
                Ok(child) => child,
                Err(err) => return Err(self.fail(err)),
            };

            info!(%url, pid = child.pid(), "waiting for dev server");
            // The dev server leads its own process group, so a terminal
            // Ctrl-C no longer reaches it; tear it down before giving up.
            let report = tokio::select! {
                report = readiness::wait_for_target(&target) => report,
                () = shutdown_signal() => Err(AppError::Interrupted),
            };

            let failure = match report {
                Ok(report) if report.ready => {
                    self.state = LauncherState::Running(RunTarget::Dev);
                    info!(state = %self.state, attempts = report.attempts, "dev server is reachable");
                    return Ok(child);
                }
                Ok(_) => AppError::ReadinessTimeout {
                    url: url.clone(),
                    timeout: target.timeout(),
                },
                Err(err) => err,
            };

            warn!(pid = child.pid(), %failure, "dev server launch failed; cleaning up");
            if let Err(cleanup) = child
                .terminate(self.config.children_grace(), self.config.process_grace())
                .await
            {
                return Err(self.fail(cleanup));
            }
            Err(self.fail(failure))
        }
        .instrument(span)
        .await
    }

    /// Record that the session ended with `code`.
    pub fn exit(&mut self, code: i32) {
        self.state = LauncherState::Exited(code);
        info!(state = %self.state, "launcher session finished");
    }

    fn settle(&mut self, result: Result<()>, next: LauncherState) -> Result<()> {
        match result {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: AppError) -> AppError {
        self.state = LauncherState::Exited(err.exit_code());
        err
    }
}
