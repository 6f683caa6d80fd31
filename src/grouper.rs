//! Deduplicate requested names into channels, and open them in batches.
//!
//! Every distinct (provider, top-level name) pair gets one slot, assigned in order of
//! first appearance. Slots are handed out in groups: all the slots added since the last
//! connect form one [`ChannelGroup`], which is opened as a single batch. Earlier groups
//! are never reopened, so growing a table leaves existing connections and slot numbers
//! exactly as they were.

use std::{collections::HashMap, time::Duration};

use tokio::time::{Instant, timeout_at};
use tracing::{debug, debug_span, warn};

use crate::{
    error::PvError,
    name::{ChannelName, Provider},
    transport::{ChannelInfo, Slot, Transport, TransportError},
};

/// A contiguous run of slots opened together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub first_slot: Slot,
    pub len: usize,
    opened: bool,
}

impl ChannelGroup {
    pub fn slots(&self) -> std::ops::Range<Slot> {
        self.first_slot..self.first_slot + self.len
    }
    /// Whether this group has been through a connect
    pub fn is_opened(&self) -> bool {
        self.opened
    }
}

#[derive(Debug)]
struct SlotState {
    name: String,
    provider: Provider,
    info: Option<ChannelInfo>,
    connected: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionGrouper {
    slots: Vec<SlotState>,
    lookup: HashMap<(Provider, String), Slot>,
    groups: Vec<ChannelGroup>,
}

impl ConnectionGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for a name, creating one if this channel has not been seen before
    pub fn assign(&mut self, name: &ChannelName) -> Slot {
        if let Some(slot) = self.slot_of(name) {
            return slot;
        }
        let slot = self.slots.len();
        self.slots.push(SlotState {
            name: name.top_level.clone(),
            provider: name.provider,
            info: None,
            connected: false,
        });
        self.lookup
            .insert((name.provider, name.top_level.clone()), slot);
        match self.groups.last_mut() {
            Some(group) if !group.opened => group.len += 1,
            _ => self.groups.push(ChannelGroup {
                first_slot: slot,
                len: 1,
                opened: false,
            }),
        }
        slot
    }

    pub fn slot_of(&self, name: &ChannelName) -> Option<Slot> {
        self.lookup
            .get(&(name.provider, name.top_level.clone()))
            .copied()
    }

    /// Open every group that has not yet been opened, waiting at most `timeout`.
    ///
    /// Returns the slots that failed to connect. These are not fatal: the slots stay
    /// disconnected until a later [`ConnectionGrouper::refresh`] sees them come up.
    pub async fn connect<T: Transport>(
        &mut self,
        transport: &mut T,
        timeout: Duration,
    ) -> Vec<(Slot, PvError)> {
        let deadline = Instant::now() + timeout;
        let mut pending = Vec::new();
        for group in self.groups.iter_mut().filter(|g| !g.opened) {
            let _span = debug_span!("open_group", first_slot = group.first_slot).entered();
            debug!("Opening {} channels", group.len);
            for slot in group.slots() {
                let state = &self.slots[slot];
                pending.push((
                    slot,
                    transport.open_channel(slot, &state.name, state.provider),
                ));
            }
            group.opened = true;
        }

        let mut failures = Vec::new();
        for (slot, reply) in pending {
            let state = &mut self.slots[slot];
            let result = match timeout_at(deadline, reply).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TransportError::Closed),
                Err(_) => {
                    warn!("Timed out connecting to {}", state.name);
                    failures.push((slot, PvError::ConnectionTimeout(state.name.clone())));
                    continue;
                }
            };
            match result {
                Ok(info) => {
                    debug!("Slot {slot} connected to {}: {info:?}", state.name);
                    state.connected = true;
                    state.info = Some(info);
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {e}", state.name);
                    failures.push((
                        slot,
                        PvError::Transport {
                            name: state.name.clone(),
                            source: e,
                        },
                    ));
                }
            }
        }
        failures
    }

    /// Pick up changes in connection state since the last connect
    pub fn refresh<T: Transport>(&mut self, transport: &T) {
        for (slot, state) in self.slots.iter_mut().enumerate() {
            let connected = transport.is_connected(slot);
            if connected != state.connected {
                debug!(
                    "Slot {slot} ({}) is now {}",
                    state.name,
                    if connected { "connected" } else { "disconnected" }
                );
            }
            if connected && state.info.is_none() {
                state.info = transport.channel_info(slot);
            }
            state.connected = connected;
        }
    }

    /// Record a lost channel until the next refresh asks the transport again
    pub(crate) fn mark_disconnected(&mut self, slot: Slot) {
        if let Some(state) = self.slots.get_mut(slot) {
            state.connected = false;
        }
    }

    pub fn is_connected(&self, slot: Slot) -> bool {
        self.slots.get(slot).is_some_and(|s| s.connected)
    }

    pub fn info(&self, slot: Slot) -> Option<&ChannelInfo> {
        self.slots.get(slot).and_then(|s| s.info.as_ref())
    }

    pub fn provider(&self, slot: Slot) -> Option<Provider> {
        self.slots.get(slot).map(|s| s.provider)
    }

    /// Number of distinct channels
    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    pub fn groups(&self) -> &[ChannelGroup] {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pvdata::nt_scalar, transports::memory::MemoryTransport};

    fn names(list: &[&str]) -> Vec<ChannelName> {
        list.iter()
            .map(|n| ChannelName::parse(n, Provider::Pva).unwrap())
            .collect()
    }

    #[test]
    fn dedup_by_provider_and_top_level() {
        let mut grouper = ConnectionGrouper::new();
        let slots: Vec<Slot> = names(&["A.x", "B", "A.y", "ca://A", "B"])
            .iter()
            .map(|n| grouper.assign(n))
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 2, 1]);
        assert_eq!(grouper.channel_count(), 3);
        assert_eq!(grouper.groups().len(), 1);
        assert_eq!(grouper.groups()[0].slots(), 0..3);
    }

    #[tokio::test]
    async fn groups_are_opened_once() {
        let mut transport = MemoryTransport::new();
        for name in ["A", "B", "C"] {
            transport.add_pv(name, nt_scalar(0.0f64)).unwrap();
        }
        let mut grouper = ConnectionGrouper::new();
        for name in names(&["A", "B"]) {
            grouper.assign(&name);
        }
        let failures = grouper
            .connect(&mut transport, Duration::from_secs(1))
            .await;
        assert!(failures.is_empty());
        assert_eq!(transport.open_count(), 2);

        // Growing only opens the new group
        for name in names(&["A", "C"]) {
            grouper.assign(&name);
        }
        assert_eq!(grouper.groups().len(), 2);
        grouper
            .connect(&mut transport, Duration::from_secs(1))
            .await;
        assert_eq!(transport.open_count(), 3);
        assert!((0..3).all(|slot| grouper.is_connected(slot)));

        // Nothing new, nothing opened
        grouper
            .connect(&mut transport, Duration::from_secs(1))
            .await;
        assert_eq!(transport.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_slots_time_out_and_recover() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("UP", nt_scalar(1i32)).unwrap();
        transport.add_pv("DOWN", nt_scalar(1i32)).unwrap();
        transport.set_reachable("DOWN", false);

        let mut grouper = ConnectionGrouper::new();
        for name in names(&["UP", "DOWN"]) {
            grouper.assign(&name);
        }
        let failures = grouper
            .connect(&mut transport, Duration::from_secs(2))
            .await;
        assert_eq!(
            failures,
            vec![(1, PvError::ConnectionTimeout("DOWN".to_string()))]
        );
        assert!(grouper.is_connected(0));
        assert!(!grouper.is_connected(1));

        transport.set_reachable("DOWN", true);
        grouper.refresh(&transport);
        assert!(grouper.is_connected(1));
        assert!(grouper.info(1).is_some());
    }
}
