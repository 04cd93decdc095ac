//! Error types shared across the launcher.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering every launcher failure mode.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure, including malformed
    /// readiness URLs and non-positive durations.
    Config(String),
    /// A frontend tooling command exited unsuccessfully.
    Subprocess {
        /// Launcher step that ran the command (`install`, `build`, `dev`).
        step: String,
        /// Command line as configured.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
    /// The OS refused to start a command.
    Spawn(String),
    /// The dev server did not answer before the launch deadline.
    ReadinessTimeout {
        /// Probed URL.
        url: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// A process survived both the graceful signal and the forceful kill.
    Termination(String),
    /// The GUI/web bridge failed to bind or serve.
    Bridge(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Ctrl-C or SIGTERM arrived before the window opened.
    Interrupted,
}

impl AppError {
    /// Process exit code that should be reported for this error.
    ///
    /// Subprocess failures propagate the child's own code when it has one
    /// and an interrupt maps to `130`. Everything else maps to `1`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Subprocess {
                code: Some(code), ..
            } if *code != 0 => *code,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Subprocess {
                step,
                command,
                code,
            } => {
                let status = code.map_or_else(
                    || "was terminated by a signal".to_owned(),
                    |c| format!("exited with code {c}"),
                );
                write!(
                    f,
                    "{step}: `{command}` {status}; check the command output above for details"
                )
            }
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::ReadinessTimeout { url, timeout } => write!(
                f,
                "readiness: dev server at {url} did not respond within {}s",
                timeout.as_secs_f64()
            ),
            Self::Termination(msg) => write!(f, "termination: {msg}"),
            Self::Bridge(msg) => write!(f, "bridge: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Interrupted => f.write_str("interrupted: shutdown signal received"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
