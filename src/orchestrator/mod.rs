//! Frontend process orchestration.
//!
//! Covers readiness polling, process tree termination, tooling command
//! execution, the mode state machine, and the session controller that ties
//! them to the GUI bridge.

pub mod readiness;
pub mod session;
pub mod spawner;
pub mod state_machine;
pub mod terminator;
