//! Get, put and monitor drivers, each extending [`crate::PvTable`].
//!
//! The three modes keep separate buffers on every entry: get accumulates into the
//! history, put drains a staged buffer, and monitor overwrites a single reading.

pub mod get;
pub mod monitor;
pub mod put;

pub use get::GetReport;
pub use monitor::MonitorState;
