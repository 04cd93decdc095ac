//! Launcher configuration parsing, environment overrides, and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::mode::Mode;
use crate::orchestrator::readiness;
use crate::{AppError, Result};

/// Environment variable overriding `dev_server.host`.
pub const ENV_DEV_HOST: &str = "LAUNCHER_DEV_HOST";
/// Environment variable overriding `dev_server.port`.
pub const ENV_DEV_PORT: &str = "LAUNCHER_DEV_PORT";
/// Environment variable overriding `bridge.host`.
pub const ENV_BRIDGE_HOST: &str = "LAUNCHER_BRIDGE_HOST";
/// Environment variable overriding `bridge.port`.
pub const ENV_BRIDGE_PORT: &str = "LAUNCHER_BRIDGE_PORT";
/// Environment variable overriding `frontend.build_dir`.
pub const ENV_BUILD_DIR: &str = "LAUNCHER_BUILD_DIR";

/// Upper bound for either termination grace period.
pub const MAX_GRACE_SECONDS: u64 = 60 * 60;
/// Upper bound for the readiness poll interval and the bridge close delay.
pub const MAX_INTERVAL_MS: u64 = 60_000;

/// Frontend project layout and tooling commands.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct FrontendConfig {
    /// Frontend project directory; tooling commands run here.
    pub dir: PathBuf,
    /// Directory whose presence marks dependencies as installed, relative to `dir`.
    pub install_dir: PathBuf,
    /// Production build output directory, relative to `dir`.
    pub build_dir: PathBuf,
    /// Entry page served from the build output.
    pub entry: String,
    /// Command that installs frontend dependencies.
    pub install_command: String,
    /// Long-running command that starts the dev server.
    pub dev_command: String,
    /// Command that produces the production build.
    pub build_command: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("frontend"),
            install_dir: PathBuf::from("node_modules"),
            build_dir: PathBuf::from("build"),
            entry: "index.html".into(),
            install_command: "npm install".into(),
            dev_command: "npm run dev".into(),
            build_command: "npm run build".into(),
        }
    }
}

/// Dev server address and readiness polling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct DevServerConfig {
    /// Host the dev server listens on.
    pub host: String,
    /// Port the dev server listens on.
    pub port: u16,
    /// Seconds to wait for the dev server to answer.
    pub launch_timeout_seconds: u64,
    /// Milliseconds between readiness probes.
    pub poll_interval_ms: u64,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5173,
            launch_timeout_seconds: 30,
            poll_interval_ms: 100,
        }
    }
}

/// The bridge's own HTTP server and window handling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BridgeConfig {
    /// Host the bridge binds.
    pub host: String,
    /// Port the bridge binds; `0` asks the OS for a free port.
    pub port: u16,
    /// Open the bridge URL with the system's default browser once bound.
    pub open_browser: bool,
    /// Milliseconds the bridge waits after the last page disconnects before
    /// treating the window as closed. A reload reconnects within it.
    pub close_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8000,
            open_browser: true,
            close_delay_ms: 1000,
        }
    }
}

impl BridgeConfig {
    /// Grace period between the last page disconnecting and the close.
    #[must_use]
    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }
}

/// Grace periods used when tearing down the dev server process tree.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TerminationConfig {
    /// Seconds descendants get to exit before being killed.
    pub children_grace_seconds: u64,
    /// Seconds the root process gets to exit before being killed.
    pub process_grace_seconds: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            children_grace_seconds: 5,
            process_grace_seconds: 5,
        }
    }
}

/// Launcher configuration, optionally parsed from `launcher.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct LauncherConfig {
    /// Modes run when none are given on the command line.
    pub default_modes: Vec<Mode>,
    /// Frontend project layout and commands.
    pub frontend: FrontendConfig,
    /// Dev server address and polling.
    pub dev_server: DevServerConfig,
    /// Bridge server address.
    pub bridge: BridgeConfig,
    /// Process tree teardown grace periods.
    pub termination: TerminationConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            default_modes: vec![Mode::default()],
            frontend: FrontendConfig::default(),
            dev_server: DevServerConfig::default(),
            bridge: BridgeConfig::default(),
            termination: TerminationConfig::default(),
        }
    }
}

impl LauncherConfig {
    /// Build the configuration from an optional TOML file, then apply
    /// environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, an override is malformed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|err| {
                    AppError::Config(format!("failed to read {}: {err}", path.display()))
                })?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// Environment overrides are not applied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute-or-relative path of the dependency install marker.
    #[must_use]
    pub fn install_marker(&self) -> PathBuf {
        self.frontend.dir.join(&self.frontend.install_dir)
    }

    /// Path of the production build output directory.
    #[must_use]
    pub fn build_output(&self) -> PathBuf {
        self.frontend.dir.join(&self.frontend.build_dir)
    }

    /// URL probed to decide whether the dev server is up.
    #[must_use]
    pub fn dev_server_url(&self) -> String {
        format!("http://{}:{}/", self.dev_server.host, self.dev_server.port)
    }

    /// Readiness deadline for the dev server.
    #[must_use]
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.dev_server.launch_timeout_seconds)
    }

    /// Interval between readiness probes.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.dev_server.poll_interval_ms)
    }

    /// Grace period for descendants of the dev server.
    #[must_use]
    pub fn children_grace(&self) -> Duration {
        Duration::from_secs(self.termination.children_grace_seconds)
    }

    /// Grace period for the dev server process itself.
    #[must_use]
    pub fn process_grace(&self) -> Duration {
        Duration::from_secs(self.termination.process_grace_seconds)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(host) = env_value(ENV_DEV_HOST) {
            self.dev_server.host = host;
        }
        if let Some(port) = env_value(ENV_DEV_PORT) {
            self.dev_server.port = parse_port(ENV_DEV_PORT, &port)?;
        }
        if let Some(host) = env_value(ENV_BRIDGE_HOST) {
            self.bridge.host = host;
        }
        if let Some(port) = env_value(ENV_BRIDGE_PORT) {
            self.bridge.port = parse_port(ENV_BRIDGE_PORT, &port)?;
        }
        if let Some(dir) = env_value(ENV_BUILD_DIR) {
            self.frontend.build_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.dev_server.launch_timeout_seconds == 0 {
            return Err(AppError::Config(
                "dev_server.launch_timeout_seconds must be greater than zero".into(),
            ));
        }

        let max_timeout = readiness::MAX_TIMEOUT.as_secs();
        if self.dev_server.launch_timeout_seconds > max_timeout {
            return Err(AppError::Config(format!(
                "dev_server.launch_timeout_seconds must be at most {max_timeout}"
            )));
        }

        if self.dev_server.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "dev_server.poll_interval_ms must be greater than zero".into(),
            ));
        }

        for (key, value) in [
            ("dev_server.poll_interval_ms", self.dev_server.poll_interval_ms),
            ("bridge.close_delay_ms", self.bridge.close_delay_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(AppError::Config(format!(
                    "{key} must be at most {MAX_INTERVAL_MS}"
                )));
            }
        }

        for (key, value) in [
            (
                "termination.children_grace_seconds",
                self.termination.children_grace_seconds,
            ),
            (
                "termination.process_grace_seconds",
                self.termination.process_grace_seconds,
            ),
        ] {
            if value > MAX_GRACE_SECONDS {
                return Err(AppError::Config(format!(
                    "{key} must be at most {MAX_GRACE_SECONDS}"
                )));
            }
        }

        if self.default_modes.is_empty() {
            return Err(AppError::Config("default_modes must not be empty".into()));
        }

        if self.dev_server.host.trim().is_empty() || self.bridge.host.trim().is_empty() {
            return Err(AppError::Config("hosts must not be empty".into()));
        }

        for (key, command) in [
            ("install_command", &self.frontend.install_command),
            ("dev_command", &self.frontend.dev_command),
            ("build_command", &self.frontend.build_command),
        ] {
            match shlex::split(command) {
                Some(parts) if !parts.is_empty() => {}
                _ => {
                    return Err(AppError::Config(format!(
                        "frontend.{key} is empty or not a valid command line"
                    )))
                }
            }
        }

        if self.frontend.entry.trim().is_empty() {
            return Err(AppError::Config("frontend.entry must not be empty".into()));
        }

        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        debug!(key, value = trimmed, "applying environment override");
        Some(trimmed.to_owned())
    }
}

fn parse_port(key: &str, raw: &str) -> Result<u16> {
    raw.parse()
        .map_err(|err| AppError::Config(format!("{key}={raw} is not a valid port: {err}")))
}
