//! Session controller: runs the requested modes and owns the dev server.
//!
//! The session is the single owner of the dev server [`ManagedChild`]. It
//! starts the bridge only after the dev server is reachable (dev) or after
//! a build artifact is confirmed present (prod). When the window closes, it
//! tears the dev server's process tree down before reporting the exit code.
//! No step exits the process; the caller turns the returned code or error
//! into the process status.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::spawner::ManagedChild;
use super::state_machine::{LauncherState, ModeOrchestrator};
use crate::bridge::{BridgeTarget, CloseEvent, GuiBridge};
use crate::config::LauncherConfig;
use crate::mode::{Mode, Step};
use crate::{AppError, Result};

/// One launcher invocation.
pub struct Session {
    config: Arc<LauncherConfig>,
    bridge: Arc<dyn GuiBridge>,
    child: Option<ManagedChild>,
    final_state: Option<LauncherState>,
}

impl Session {
    /// Create a session over `config`, serving through `bridge`.
    #[must_use]
    pub fn new(config: Arc<LauncherConfig>, bridge: Arc<dyn GuiBridge>) -> Self {
        Self {
            config,
            bridge,
            child: None,
            final_state: None,
        }
    }

    /// State the orchestrator was in when the last [`Self::run`] returned.
    #[must_use]
    pub fn final_state(&self) -> Option<LauncherState> {
        self.final_state
    }

    /// Run `modes` in order, falling back to the configured
    /// `default_modes` when empty.
    ///
    /// Entering a running step ends the session once the window closes;
    /// any modes after it are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first step failure. The dev server, if one was started,
    /// is terminated before the error is returned.
    pub async fn run(&mut self, modes: &[Mode]) -> Result<i32> {
        let modes = if modes.is_empty() {
            self.config.default_modes.clone()
        } else {
            modes.to_vec()
        };

        let config = Arc::clone(&self.config);
        let mut orchestrator = ModeOrchestrator::new(&config);

        let result = self.run_modes(&mut orchestrator, &modes).await;

        // Nothing may outlive the session, whatever path led here.
        let cleanup = self.shutdown_child().await;

        let result = match (result, cleanup) {
            (Ok(code), Ok(())) => Ok(code),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(cleanup_err)) => {
                error!(%cleanup_err, "dev server cleanup also failed");
                Err(err)
            }
        };

        match &result {
            Ok(code) => orchestrator.exit(*code),
            Err(err) => orchestrator.exit(err.exit_code()),
        }
        self.final_state = Some(orchestrator.state());
        result
    }

    async fn run_modes(
        &mut self,
        orchestrator: &mut ModeOrchestrator<'_>,
        modes: &[Mode],
    ) -> Result<i32> {
        let plan: Vec<Step> = modes.iter().flat_map(|mode| mode.steps()).copied().collect();
        info!(?modes, ?plan, "launcher plan");

        for (index, step) in plan.iter().enumerate() {
            let span = info_span!("step", step = step.name());
            self.run_step(orchestrator, *step).instrument(span).await?;

            if step.is_running() {
                let skipped = &plan[index + 1..];
                if !skipped.is_empty() {
                    warn!(?skipped, "session ended after window closed; remaining steps skipped");
                }
                return Ok(0);
            }
        }

        Ok(0)
    }

    async fn run_step(&mut self, orchestrator: &mut ModeOrchestrator<'_>, step: Step) -> Result<()> {
        match step {
            Step::Install => orchestrator.install().await,
            Step::Build => orchestrator.build().await,
            Step::Launch => {
                orchestrator.prepare_launch().await?;
                let target = BridgeTarget::Assets {
                    root: self.config.build_output(),
                    entry: self.config.frontend.entry.clone(),
                };
                let event = self
                    .bridge
                    .serve(target, CancellationToken::new())
                    .await?;
                log_close(&event);
                Ok(())
            }
            Step::Dev => {
                let child = orchestrator.start_dev().await?;
                self.child = Some(child);
                self.serve_dev().await
            }
        }
    }

    /// Serve the bridge against the dev server until the window closes or
    /// the dev server dies, then tear the dev server down.
    async fn serve_dev(&mut self) -> Result<()> {
        let target = BridgeTarget::DevProxy {
            host: self.config.dev_server.host.clone(),
            port: self.config.dev_server.port,
        };
        let cancel = CancellationToken::new();
        let bridge = Arc::clone(&self.bridge);
        let serving = bridge.serve(target, cancel.clone());
        tokio::pin!(serving);

        let Some(child) = self.child.as_mut() else {
            return Err(AppError::Spawn("dev server is not running".into()));
        };

        let outcome = tokio::select! {
            closed = &mut serving => closed.map(|event| {
                log_close(&event);
            }),
            exited = child.wait() => {
                let code = exited?;
                error!(?code, "dev server exited while the window was open");
                cancel.cancel();
                if let Err(err) = serving.await {
                    warn!(%err, "bridge failed while shutting down");
                }
                Err(AppError::Subprocess {
                    step: "dev".into(),
                    command: child.command().to_owned(),
                    code,
                })
            }
        };

        let cleanup = self.shutdown_child().await;
        outcome?;
        cleanup
    }

    /// Terminate the dev server tree if one is still tracked.
    async fn shutdown_child(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        let killed = child
            .terminate(self.config.children_grace(), self.config.process_grace())
            .await?;
        info!(pid = child.pid(), killed, state = ?child.state(), "dev server stopped");
        Ok(())
    }
}

fn log_close(event: &CloseEvent) {
    info!(
        page = event.page,
        connections = event.connections.len(),
        "window closed; ending session"
    );
}
