//! The seam between the PV table and a network client.
//!
//! A [`Transport`] hands out request handles rather than doing any waiting itself:
//! every request returns a [`oneshot::Receiver`] that the access-mode drivers collect
//! for a whole batch and then await against a single deadline. Monitors hand back a
//! [`broadcast::Receiver`] of structures that the table drains on its own schedule.

use tokio::sync::{broadcast, oneshot};

use crate::{name::Provider, pvdata::PvField, pvdata::PvStructure};

/// Index into a table's deduplicated channel list
pub type Slot = usize;

/// Access rights granted on a channel
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Summary of an opened channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Where the channel is served from, if the transport knows
    pub remote_address: Option<String>,
    pub access: Access,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("The channel is disconnected")]
    Disconnected,
    #[error("No channel is open on slot {0}")]
    NoSuchChannel(Slot),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("The subscription or transport has closed")]
    Closed,
}

/// A live subscription to value changes
#[derive(Debug)]
pub struct Monitor {
    /// Transport-assigned identifier, used to pause and resume
    pub id: u64,
    pub events: broadcast::Receiver<PvStructure>,
}

pub type Reply<T> = oneshot::Receiver<Result<T, TransportError>>;

/// Connect, read, write and subscribe primitives of a client network layer
pub trait Transport {
    /// Start opening a channel, to be addressed by `slot` from then on.
    ///
    /// The reply resolves once the channel connects. A channel that cannot be reached
    /// may never reply; the caller bounds the wait.
    fn open_channel(&mut self, slot: Slot, name: &str, provider: Provider) -> Reply<ChannelInfo>;

    /// Whether the channel on `slot` is currently connected
    fn is_connected(&self, slot: Slot) -> bool;

    /// Details of a connected channel, for channels that came up after their open timed out
    #[allow(unused_variables)]
    fn channel_info(&self, slot: Slot) -> Option<ChannelInfo> {
        None
    }

    /// Start a read of the channel, optionally restricted to a sub-field path
    fn issue_get(&mut self, slot: Slot, sub_field: Option<&str>) -> Reply<PvStructure>;

    /// Start a write of `value` into the field at the dotted `field_path`
    fn issue_put(&mut self, slot: Slot, field_path: &str, value: PvField) -> Reply<()>;

    /// Subscribe to changes of the channel, optionally restricted to a sub-field path.
    ///
    /// The current value is expected to be delivered as the first event.
    fn subscribe(&mut self, slot: Slot, sub_field: Option<&str>)
    -> Result<Monitor, TransportError>;

    /// Stop or restart delivery of events on a monitor without cancelling it
    #[allow(unused_variables)]
    fn set_monitor_active(&mut self, monitor: u64, active: bool) -> Result<(), TransportError> {
        Err(TransportError::Rejected(
            "pausing monitors is not supported".to_string(),
        ))
    }
}
