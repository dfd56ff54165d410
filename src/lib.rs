//! Headless render driver for browser-based animation projects.
//!
//! For each configured project the [`Driver`] installs dependencies, starts the project's dev
//! server, clicks the in-page render control through a headless browser, detects completion
//! from filesystem activity and moves the finished video to its destination.
#![forbid(unsafe_code)]

pub mod browser;
pub mod completion;
pub mod config;
pub mod driver;
pub mod finalize;
mod foundation;
pub mod job;
pub mod process;
pub mod telemetry;

pub use browser::{BrowserDriver, BrowserLauncher, BrowserSession, NodeBridge, NodeBridgeLauncher};
pub use completion::{
    QuiescenceWatch, StartState, StartWatch, WatchState, await_file_exists, await_quiescence,
};
pub use config::{BrowserConfig, DriverConfig, ProjectConfig, Timeouts};
pub use driver::{Driver, DriverReport, JobReport};
pub use finalize::{clear_stale_output, finalize_artifact};
pub use foundation::core::{PageId, Viewport};
pub use foundation::error::{DriverError, DriverResult, JobPhase};
pub use job::RenderJob;
pub use process::{ServerProcess, ServerState, prepare_project};
