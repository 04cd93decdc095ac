#![forbid(unsafe_code)]

//! Launcher that runs a web GUI bridge next to a frontend dev server or a
//! production build, and guarantees the dev server's whole process tree is
//! gone when the window closes.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod mode;
pub mod orchestrator;
pub mod shutdown;

pub use config::LauncherConfig;
pub use errors::{AppError, Result};
