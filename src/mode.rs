//! Launcher modes and the steps each one runs.
//!
//! `Mode` is the positional CLI value. Every mode maps to an ordered list of
//! [`Step`]s through [`Mode::steps`]; prerequisites (install before build,
//! build before launch) are resolved by the steps themselves.

use std::fmt::{Display, Formatter};

use clap::ValueEnum;
use serde::Deserialize;

/// What the launcher was asked to do.
///
/// Defaults to [`Mode::BuildThenLaunch`] when no mode is given. Config files
/// name modes the same way the command line does (`default_modes`).
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Install the frontend dependencies.
    Install,
    /// Start the dev server and open the bridge against it.
    Dev,
    /// Build the frontend for production.
    Build,
    /// Open the bridge on a prior production build, building first if none exists.
    #[value(name = "run", alias = "launch")]
    #[serde(rename = "run", alias = "launch")]
    Launch,
    /// Build the frontend, then open the bridge on the fresh build.
    #[default]
    BuildThenLaunch,
}

/// A single unit of work in a mode's plan.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Step {
    /// Run the install command unconditionally.
    Install,
    /// Install if needed, then run the build command.
    Build,
    /// Install if needed, start the dev server, wait, then serve.
    Dev,
    /// Build if no artifact exists, then serve the artifact.
    Launch,
}

impl Mode {
    /// Ordered steps this mode runs.
    #[must_use]
    pub fn steps(self) -> &'static [Step] {
        match self {
            Self::Install => &[Step::Install],
            Self::Dev => &[Step::Dev],
            Self::Build => &[Step::Build],
            Self::Launch => &[Step::Launch],
            Self::BuildThenLaunch => &[Step::Build, Step::Launch],
        }
    }
}

impl Step {
    /// Whether this step hands control to the bridge and ends the session.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Dev | Self::Launch)
    }

    /// Short name used in logs and error messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Build => "build",
            Self::Dev => "dev",
            Self::Launch => "launch",
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
