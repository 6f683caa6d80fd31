//! Typed client-side value cache and dispatcher for EPICS process variables.
//!
//! Tools that log, ramp, or watch hundreds of PVs at once all need the same plumbing:
//! connect a long list of names without opening the same channel twice, turn whatever
//! shape each PV has on the wire into something uniform, and read, write or monitor the
//! whole list in one go. This crate is that plumbing, without the network itself.
//!
//! <div class="warning">This is a very early version of this library. Interfaces or
//! structure may be changed around wildly between versions until a comfortable
//! final design is settled upon.</div>
//!
//! The pieces are:
//!
//! - A [`PvTable`], holding one [`PvEntry`] per requested name. Names sharing a channel
//!   (`BPM1.x` and `BPM1.y` under pvAccess) share a connection slot, and the table can
//!   grow at any time without disturbing slots already handed out.
//! - A [`Reading`], the single in-memory form of a value: doubles, strings, or for
//!   enumerated PVs both the index and its label.
//! - Shape dispatch in [`dispatch`], that works out once per PV where its value lives
//!   (scalar, scalar array, enum, or nested inside a structure) and caches that as a
//!   [`Shape`].
//! - Access drivers: [`PvTable::get`] accumulates history, [`PvTable::put`] writes staged
//!   values, and [`PvTable::start_monitor`] / [`PvTable::poll`] keep a single
//!   overwritten reading per PV.
//! - The [`Transport`] trait, that a network client implements to plug into the table.
//!   [`transports::MemoryTransport`] hosts PVs in process, for testing and demos.
//!
//! ## Example
//!
//! ```
//! use pvtable::{PvTableBuilder, pvdata::{nt_enum, nt_scalar}, transports::MemoryTransport};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let mut transport = MemoryTransport::new();
//!     transport.add_pv("MAG:I", nt_scalar(1.5f64)).unwrap();
//!     transport.add_pv("MAG:MODE", nt_enum(0, &["Off", "On"])).unwrap();
//!
//!     let mut table = PvTableBuilder::new().build(transport);
//!     table.add_names(["MAG:I", "MAG:MODE"]).unwrap();
//!     table.connect().await;
//!
//!     table.stage_put(1, "On").unwrap();
//!     table.put().await.unwrap();
//!     table.get().await.unwrap();
//!     for entry in table.entries() {
//!         println!("{} = {}", entry.name(), entry.latest().unwrap());
//!     }
//! }
//! ```

pub mod access;
pub mod dispatch;
pub mod error;
pub mod grouper;
pub mod metadata;
pub mod name;
pub mod pvdata;
pub mod reading;
pub mod table;
pub mod transport;
pub mod transports;
mod utils;

pub use crate::access::{GetReport, MonitorState};
pub use crate::dispatch::Shape;
pub use crate::error::PvError;
pub use crate::metadata::PvInfo;
pub use crate::name::{ChannelName, Provider};
pub use crate::reading::Reading;
pub use crate::table::{ConnectReport, PvEntry, PvTable, PvTableBuilder};
pub use crate::transport::Transport;
pub use crate::utils::{get_default_connection_timeout, get_default_io_timeout, get_default_provider};
