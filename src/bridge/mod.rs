//! GUI/web bridge abstraction.
//!
//! The [`GuiBridge`] trait is the seam between the session controller and
//! whatever opens the window and serves the page. The controller only needs
//! two things from it: serve a target, and report when the window closed.

pub mod server;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::Result;

pub use server::HttpBridge;

/// What the bridge should put in the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeTarget {
    /// Serve a directory of built assets, opening `entry` at `/`.
    Assets {
        /// Build output directory.
        root: PathBuf,
        /// Entry page inside `root`.
        entry: String,
    },
    /// Send the window to a running dev server.
    DevProxy {
        /// Dev server host.
        host: String,
        /// Dev server port.
        port: u16,
    },
}

/// Notification that the GUI window closed.
///
/// The session treats this purely as a termination trigger; the page and
/// connection details are informational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseEvent {
    /// Page that reported the close, if known.
    pub page: String,
    /// Peers connected when the close was reported.
    pub connections: Vec<String>,
}

/// A GUI/web bridge that serves a target until its window closes.
pub trait GuiBridge: Send + Sync {
    /// Serve `target` and resolve once the window has closed.
    ///
    /// Implementations must also resolve promptly when `cancel` fires, for
    /// example because the dev server behind the window died.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Bridge`](crate::AppError::Bridge) if the bridge
    /// cannot start or fails while serving.
    fn serve(
        &self,
        target: BridgeTarget,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<CloseEvent>> + Send + '_>>;
}
