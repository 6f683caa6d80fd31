use std::time::Duration;

use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::{debug, debug_span, trace, warn};

use crate::{
    dispatch,
    error::PvError,
    grouper::ConnectionGrouper,
    pvdata::PvStructure,
    reading::Reading,
    table::{PvEntry, PvTable},
    transport::{Monitor, Transport, TransportError},
};

/// Where an entry is in its monitor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Unmonitored,
    Active,
    Paused,
}

/// A wrapper around the transport's event receiver, skipping over lag
#[derive(Debug)]
pub(crate) struct Subscription {
    id: u64,
    events: broadcast::Receiver<PvStructure>,
    paused: bool,
}

impl Subscription {
    fn new(monitor: Monitor) -> Self {
        Subscription {
            id: monitor.id,
            events: monitor.events,
            paused: false,
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    /// Drain every queued event without waiting, keeping only the newest
    fn try_latest(&mut self) -> Result<Option<PvStructure>, TransportError> {
        let mut latest = None;
        loop {
            match self.events.try_recv() {
                Ok(event) => latest = Some(event),
                Err(TryRecvError::Empty) => return Ok(latest),
                Err(TryRecvError::Lagged(n)) => {
                    trace!("Monitor {} lagged by {n} events", self.id);
                }
                Err(TryRecvError::Closed) => {
                    return latest.map(Some).ok_or(TransportError::Closed);
                }
            }
        }
    }

    /// Wait for the next event
    async fn next(&mut self) -> Result<PvStructure, TransportError> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Ok(event),
                Err(RecvError::Lagged(n)) => {
                    trace!("Monitor {} lagged by {n} events", self.id);
                }
                Err(RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    /// Throw away anything queued so far
    fn discard_pending(&mut self) {
        self.events = self.events.resubscribe();
    }
}

impl PvEntry {
    /// Overwrite the monitor buffer from an event
    fn record_event(&mut self, structure: &PvStructure) -> Result<(), PvError> {
        self.classify_from(structure)?;
        let buffer = self.monitor_buffer.get_or_insert_with(Reading::default);
        dispatch::extract_into(structure, &self.shape, buffer)
            .map_err(|e| e.for_pv(&self.name.requested))?;
        let element_count = buffer.len();
        self.absorb_metadata(structure, element_count);
        Ok(())
    }

    /// Drop a subscription the transport has closed, and the channel with it
    fn close_subscription(&mut self, grouper: &mut ConnectionGrouper) {
        warn!("Monitor on {} closed", self.name);
        self.subscription = None;
        self.connected = false;
        grouper.mark_disconnected(self.slot);
    }
}

impl<T: Transport> PvTable<T> {
    /// Subscribe every connected entry that is not already monitored.
    ///
    /// Returns the number of new subscriptions. Connection state is rechecked first, so
    /// entries that have come up since the last call are picked up.
    pub fn start_monitor(&mut self) -> Result<usize, PvError> {
        self.refresh_connections();
        let mut started = 0;
        let mut errors = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if !entry.connected || entry.subscription.is_some() {
                continue;
            }
            let _span = debug_span!("start_monitor", index = index).entered();
            match self.transport.subscribe(entry.slot, entry.sub_field()) {
                Ok(monitor) => {
                    debug!("Monitoring {} as {}", entry.name, monitor.id);
                    entry.subscription = Some(Subscription::new(monitor));
                    started += 1;
                }
                Err(source) => {
                    warn!("Could not monitor {}: {source}", entry.name);
                    errors.push(PvError::Transport {
                        name: entry.name().to_string(),
                        source,
                    });
                }
            }
        }
        PvError::from_batch(errors)?;
        Ok(started)
    }

    /// Take the newest pending event of every active entry, without waiting.
    ///
    /// Returns the number of entries that had an event. Entries whose subscription has
    /// closed go back to unmonitored and are marked not connected.
    pub fn poll(&mut self) -> Result<usize, PvError> {
        let mut count = 0;
        let mut errors = Vec::new();
        for entry in &mut self.entries {
            let Some(subscription) = entry.subscription.as_mut() else {
                continue;
            };
            if subscription.is_paused() {
                continue;
            }
            match subscription.try_latest() {
                Ok(None) => {}
                Ok(Some(structure)) => match entry.record_event(&structure) {
                    Ok(()) => count += 1,
                    Err(e) => errors.push(e),
                },
                Err(_) => entry.close_subscription(&mut self.grouper),
            }
        }
        PvError::from_batch(errors)?;
        Ok(count)
    }

    /// Wait up to `timeout` for the next event on one entry.
    ///
    /// Returns `None` if nothing arrived in time, or the entry is paused.
    pub async fn wait_one(
        &mut self,
        index: usize,
        timeout: Duration,
    ) -> Result<Option<&Reading>, PvError> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(PvError::NoSuchEntry(index))?;
        let Some(subscription) = entry.subscription.as_mut() else {
            return Err(PvError::NotMonitored(entry.name().to_string()));
        };
        if subscription.is_paused() {
            return Ok(None);
        }
        let event = match tokio::time::timeout(timeout, subscription.next()).await {
            Err(_) => return Ok(None),
            Ok(Err(source)) => {
                entry.close_subscription(&mut self.grouper);
                return Err(PvError::Transport {
                    name: entry.name().to_string(),
                    source,
                });
            }
            Ok(Ok(event)) => event,
        };
        entry.record_event(&event)?;
        Ok(entry.monitor_buffer.as_ref())
    }

    /// Stop delivery on every active subscription, keeping them open
    pub fn pause(&mut self) -> Result<(), PvError> {
        self.set_monitors_active(false)
    }

    /// Restart delivery on every paused subscription.
    ///
    /// Events queued while paused are discarded, so the next event seen is current.
    pub fn resume(&mut self) -> Result<(), PvError> {
        self.set_monitors_active(true)
    }

    fn set_monitors_active(&mut self, active: bool) -> Result<(), PvError> {
        let mut errors = Vec::new();
        for entry in &mut self.entries {
            let Some(subscription) = entry.subscription.as_mut() else {
                continue;
            };
            if subscription.paused != active {
                continue;
            }
            match self.transport.set_monitor_active(subscription.id, active) {
                Ok(()) => {}
                Err(TransportError::Closed) => {
                    entry.close_subscription(&mut self.grouper);
                    continue;
                }
                // Without transport support, pausing drops events on this side only
                Err(TransportError::Rejected(reason)) => {
                    debug!("Pausing {} locally: {reason}", entry.name);
                }
                Err(source) => {
                    errors.push(PvError::Transport {
                        name: entry.name().to_string(),
                        source,
                    });
                    continue;
                }
            }
            if active {
                subscription.discard_pending();
            }
            subscription.paused = !active;
        }
        PvError::from_batch(errors)
    }

    /// Drop every subscription, returning how many there were
    pub fn stop_monitor(&mut self) -> usize {
        let mut stopped = 0;
        for entry in &mut self.entries {
            if entry.subscription.take().is_some() {
                debug!("Stopped monitoring {}", entry.name);
                stopped += 1;
            }
        }
        stopped
    }

    /// Readings of every entry from the most recent monitor event
    pub fn monitor_readings(&self) -> Vec<Option<&Reading>> {
        self.entries.iter().map(PvEntry::monitor_reading).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        PvTableBuilder,
        name::Provider,
        pvdata::{PvField, ScalarValue, nt_scalar},
        transport::{ChannelInfo, Reply, Slot},
        transports::MemoryTransport,
    };

    /// A memory transport that cannot pause delivery
    struct NoPause(MemoryTransport);

    impl Transport for NoPause {
        fn open_channel(&mut self, slot: Slot, name: &str, provider: Provider) -> Reply<ChannelInfo> {
            self.0.open_channel(slot, name, provider)
        }
        fn is_connected(&self, slot: Slot) -> bool {
            self.0.is_connected(slot)
        }
        fn channel_info(&self, slot: Slot) -> Option<ChannelInfo> {
            self.0.channel_info(slot)
        }
        fn issue_get(&mut self, slot: Slot, sub_field: Option<&str>) -> Reply<PvStructure> {
            self.0.issue_get(slot, sub_field)
        }
        fn issue_put(&mut self, slot: Slot, field_path: &str, value: PvField) -> Reply<()> {
            self.0.issue_put(slot, field_path, value)
        }
        fn subscribe(
            &mut self,
            slot: Slot,
            sub_field: Option<&str>,
        ) -> Result<Monitor, TransportError> {
            self.0.subscribe(slot, sub_field)
        }
    }

    async fn monitored(transport: &MemoryTransport, names: &[&str]) -> PvTable<MemoryTransport> {
        let mut table = PvTableBuilder::new()
            .connect_timeout(Duration::from_secs(1))
            .build(transport.clone());
        table.add_names(names).unwrap();
        table.connect().await;
        table.start_monitor().unwrap();
        table
    }

    #[tokio::test]
    async fn poll_keeps_only_the_newest() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i32)).unwrap();
        let mut table = monitored(&transport, &["A"]).await;
        assert_eq!(table.entry(0).unwrap().monitor_state(), MonitorState::Active);
        // Already subscribed
        assert_eq!(table.start_monitor().unwrap(), 0);

        for i in 1..=5 {
            transport.set_value("A", ScalarValue::Int(i)).unwrap();
        }
        assert_eq!(table.poll().unwrap(), 1);
        assert_eq!(
            table.entry(0).unwrap().monitor_reading().unwrap().values(),
            &[5.0]
        );
        assert_eq!(table.poll().unwrap(), 0);
        // Monitoring never touches the get history
        assert!(table.entry(0).unwrap().history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_one_times_out_or_returns() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(1.5f64)).unwrap();
        transport.add_pv("B", nt_scalar(0i32)).unwrap();
        let mut table = monitored(&transport, &["A"]).await;
        table.add_name("B").unwrap();

        // The initial value arrives first
        let first = table.wait_one(0, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.unwrap().values(), &[1.5]);
        assert_eq!(
            table.wait_one(0, Duration::from_secs(1)).await.unwrap(),
            None
        );
        assert!(matches!(
            table.wait_one(1, Duration::from_secs(1)).await,
            Err(PvError::NotMonitored(_))
        ));
        assert!(matches!(
            table.wait_one(7, Duration::from_secs(1)).await,
            Err(PvError::NoSuchEntry(7))
        ));
    }

    #[tokio::test]
    async fn closed_subscriptions_resubscribe() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i32)).unwrap();
        let mut table = monitored(&transport, &["A"]).await;
        table.poll().unwrap();

        transport.set_reachable("A", false);
        assert_eq!(table.poll().unwrap(), 0);
        let entry = table.entry(0).unwrap();
        assert_eq!(entry.monitor_state(), MonitorState::Unmonitored);
        assert!(!entry.is_connected());
        assert_eq!(table.start_monitor().unwrap(), 0);

        transport.set_reachable("A", true);
        assert_eq!(table.start_monitor().unwrap(), 1);
        assert_eq!(table.poll().unwrap(), 1);
        assert_eq!(table.stop_monitor(), 1);
        assert_eq!(table.monitor_readings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_one_on_a_closed_subscription() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i32)).unwrap();
        let mut table = monitored(&transport, &["A"]).await;
        assert!(
            table
                .wait_one(0, Duration::from_secs(1))
                .await
                .unwrap()
                .is_some()
        );

        transport.set_reachable("A", false);
        let err = table.wait_one(0, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            PvError::Transport {
                ref name,
                source: TransportError::Closed
            } if name == "A"
        ));
        let entry = table.entry(0).unwrap();
        assert_eq!(entry.monitor_state(), MonitorState::Unmonitored);
        assert!(!entry.is_connected());
        assert!(!table.grouper.is_connected(entry.slot()));
        assert!(matches!(
            table.wait_one(0, Duration::from_secs(1)).await,
            Err(PvError::NotMonitored(_))
        ));
    }

    #[tokio::test]
    async fn pausing_without_transport_support() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i32)).unwrap();
        let mut table = PvTableBuilder::new()
            .connect_timeout(Duration::from_secs(1))
            .build(NoPause(transport.clone()));
        table.add_names(["A"]).unwrap();
        table.connect().await;
        table.start_monitor().unwrap();
        assert_eq!(table.poll().unwrap(), 1);

        table.pause().unwrap();
        assert_eq!(table.entry(0).unwrap().monitor_state(), MonitorState::Paused);
        // The transport keeps sending, but nothing is taken while paused
        transport.set_value("A", ScalarValue::Int(1)).unwrap();
        transport.set_value("A", ScalarValue::Int(2)).unwrap();
        assert_eq!(table.poll().unwrap(), 0);

        table.resume().unwrap();
        assert_eq!(table.entry(0).unwrap().monitor_state(), MonitorState::Active);
        assert_eq!(table.poll().unwrap(), 0);
        assert_eq!(
            table.entry(0).unwrap().monitor_reading().unwrap().values(),
            &[0.0]
        );

        transport.set_value("A", ScalarValue::Int(3)).unwrap();
        assert_eq!(table.poll().unwrap(), 1);
        assert_eq!(
            table.entry(0).unwrap().monitor_reading().unwrap().values(),
            &[3.0]
        );
    }
}
