//! The PV table: one row per requested name, sharing connections by channel.
//!
//! A [`PvTable`] owns its transport and every buffer that readings land in. Rows are
//! only ever appended, so an index returned by [`PvTable::add_names`] refers to the same
//! PV for the lifetime of the table.

use std::time::{Duration, SystemTime};

use tracing::{debug, debug_span};

use crate::{
    access::monitor::{MonitorState, Subscription},
    dispatch::{self, Shape},
    error::PvError,
    grouper::{ChannelGroup, ConnectionGrouper},
    name::{ChannelName, Provider},
    pvdata::{PvStructure, ScalarType},
    reading::Reading,
    transport::{Slot, Transport},
    utils::{get_default_connection_timeout, get_default_io_timeout, get_default_provider},
};

/// One row of a [`PvTable`]
#[derive(Debug)]
pub struct PvEntry {
    pub(crate) name: ChannelName,
    pub(crate) slot: Slot,
    pub(crate) connected: bool,
    pub(crate) shape: Shape,
    pub(crate) history: Vec<Reading>,
    pub(crate) put_buffer: Option<Reading>,
    pub(crate) monitor_buffer: Option<Reading>,
    pub(crate) subscription: Option<Subscription>,
    pub(crate) alarm_severity: i32,
    pub(crate) units: Option<String>,
    pub(crate) timestamp: Option<SystemTime>,
    pub(crate) structure_id: Option<String>,
    pub(crate) choices: Vec<String>,
    pub(crate) element_count: usize,
}

impl PvEntry {
    fn new(name: ChannelName, slot: Slot) -> Self {
        PvEntry {
            name,
            slot,
            connected: false,
            shape: Shape::Unclassified,
            history: Vec::new(),
            put_buffer: None,
            monitor_buffer: None,
            subscription: None,
            alarm_severity: 0,
            units: None,
            timestamp: None,
            structure_id: None,
            choices: Vec::new(),
            element_count: 0,
        }
    }

    /// The name as it was requested
    pub fn name(&self) -> &str {
        &self.name.requested
    }
    pub fn channel_name(&self) -> &ChannelName {
        &self.name
    }
    pub fn provider(&self) -> Provider {
        self.name.provider
    }
    pub fn top_level(&self) -> &str {
        &self.name.top_level
    }
    pub fn sub_field(&self) -> Option<&str> {
        self.name.sub_field.as_deref()
    }
    pub fn slot(&self) -> Slot {
        self.slot
    }
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
    pub fn element_scalar_type(&self) -> Option<ScalarType> {
        self.shape.element_scalar_type()
    }
    pub fn is_numeric(&self) -> bool {
        self.shape.is_numeric()
    }
    pub fn is_text(&self) -> bool {
        self.shape.is_text()
    }

    /// Every reading taken by get since the history was last cleared, oldest first
    pub fn history(&self) -> &[Reading] {
        &self.history
    }
    /// The most recent reading taken by get
    pub fn latest(&self) -> Option<&Reading> {
        self.history.last()
    }
    /// The value staged for the next put
    pub fn pending_put(&self) -> Option<&Reading> {
        self.put_buffer.as_ref()
    }
    /// Number of elements staged for the next put
    pub fn pending_put_count(&self) -> usize {
        self.put_buffer.as_ref().map_or(0, Reading::len)
    }
    /// The reading from the most recent monitor event
    pub fn monitor_reading(&self) -> Option<&Reading> {
        self.monitor_buffer.as_ref()
    }
    pub fn monitor_state(&self) -> MonitorState {
        match &self.subscription {
            None => MonitorState::Unmonitored,
            Some(s) if s.is_paused() => MonitorState::Paused,
            Some(_) => MonitorState::Active,
        }
    }

    pub fn alarm_severity(&self) -> i32 {
        self.alarm_severity
    }
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }
    /// When the last reading was taken at the source, if it said
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Work out this entry's shape from a structure, if it is not already known
    pub(crate) fn classify_from(&mut self, structure: &PvStructure) -> Result<(), PvError> {
        if self.shape.is_classified() {
            return Ok(());
        }
        self.shape = dispatch::classify(structure, self.sub_field())
            .map_err(|e| e.for_pv(&self.name.requested))?;
        debug!(
            "{} classified as {} at '{}'",
            self.name,
            self.shape.class_name(),
            self.shape.value_path().unwrap_or_default()
        );
        Ok(())
    }

    /// Refresh cached metadata after a successful extraction
    pub(crate) fn absorb_metadata(&mut self, structure: &PvStructure, element_count: usize) {
        self.alarm_severity = structure.alarm_severity().unwrap_or(0);
        self.units = structure.units().map(str::to_string);
        self.timestamp = structure.timestamp();
        self.structure_id = Some(structure.id.clone());
        self.element_count = element_count;
        if matches!(self.shape, Shape::Enumerated { .. }) {
            self.choices = dispatch::enum_choices(structure, &self.shape);
        }
    }
}

/// Outcome of [`PvTable::connect`]
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// Number of entries connected
    pub connected: usize,
    /// Indices of entries that are not connected
    pub not_connected: Vec<usize>,
    /// Why channels opened by this call failed to connect
    pub failures: Vec<PvError>,
}

impl ConnectReport {
    pub fn all_connected(&self) -> bool {
        self.not_connected.is_empty()
    }
}

/// Configures and creates a [`PvTable`]
#[derive(Debug, Clone)]
pub struct PvTableBuilder {
    connect_timeout: Duration,
    io_timeout: Duration,
    default_provider: Provider,
    limited_history: bool,
}

impl Default for PvTableBuilder {
    fn default() -> Self {
        PvTableBuilder {
            connect_timeout: get_default_connection_timeout(),
            io_timeout: get_default_io_timeout(),
            default_provider: get_default_provider(),
            limited_history: false,
        }
    }
}

impl PvTableBuilder {
    pub fn new() -> Self {
        PvTableBuilder::default()
    }
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
    /// How long get and put wait for replies
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
    /// The provider used for names without a `pva://` or `ca://` prefix
    pub fn default_provider(mut self, provider: Provider) -> Self {
        self.default_provider = provider;
        self
    }
    /// Keep only the latest get reading per entry, instead of accumulating
    pub fn limited_history(mut self, limited: bool) -> Self {
        self.limited_history = limited;
        self
    }
    pub fn build<T: Transport>(self, transport: T) -> PvTable<T> {
        PvTable {
            transport,
            grouper: ConnectionGrouper::new(),
            entries: Vec::new(),
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            default_provider: self.default_provider,
            limited_history: self.limited_history,
        }
    }
}

/// A table of PVs to be read, written and monitored in bulk
#[derive(Debug)]
pub struct PvTable<T: Transport> {
    pub(crate) transport: T,
    pub(crate) grouper: ConnectionGrouper,
    pub(crate) entries: Vec<PvEntry>,
    pub(crate) connect_timeout: Duration,
    pub(crate) io_timeout: Duration,
    default_provider: Provider,
    pub(crate) limited_history: bool,
}

impl<T: Transport> PvTable<T> {
    /// A table with configuration taken from the environment
    pub fn new(transport: T) -> Self {
        PvTableBuilder::new().build(transport)
    }

    /// Append names to the table, returning the index of each.
    ///
    /// All names are parsed before any is added, so an invalid name leaves the table
    /// unchanged.
    pub fn add_names<I, S>(&mut self, names: I) -> Result<Vec<usize>, PvError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_names_with_provider(names, self.default_provider)
    }

    /// Append names, using `provider` for any without a prefix
    pub fn add_names_with_provider<I, S>(
        &mut self,
        names: I,
        provider: Provider,
    ) -> Result<Vec<usize>, PvError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = names
            .into_iter()
            .map(|n| ChannelName::parse(n.as_ref(), provider))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parsed
            .into_iter()
            .map(|name| {
                let slot = self.grouper.assign(&name);
                let index = self.entries.len();
                debug!("Added {name} as entry {index} on slot {slot}");
                self.entries.push(PvEntry::new(name, slot));
                index
            })
            .collect())
    }

    pub fn add_name(&mut self, name: &str) -> Result<usize, PvError> {
        Ok(self.add_names([name])?[0])
    }

    /// Open any channels added since the last connect, waiting up to the connect timeout.
    ///
    /// Channels that fail to connect are not an error: their entries are reported as
    /// not connected, and are picked up later if the channel comes up.
    pub async fn connect(&mut self) -> ConnectReport {
        let failures = self
            .grouper
            .connect(&mut self.transport, self.connect_timeout)
            .await;
        self.refresh_connections();

        let mut report = ConnectReport {
            failures: failures.into_iter().map(|(_, e)| e).collect(),
            ..Default::default()
        };
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.connected {
                report.connected += 1;
            } else {
                report.not_connected.push(index);
            }
        }
        debug!(
            "Connect: {} of {} entries connected over {} channels",
            report.connected,
            self.entries.len(),
            self.grouper.channel_count()
        );
        report
    }

    /// Recheck every entry's connection state against the transport
    pub(crate) fn refresh_connections(&mut self) {
        self.grouper.refresh(&self.transport);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let connected = self.grouper.is_connected(entry.slot);
            if connected != entry.connected {
                let _span = debug_span!("entry", index = index).entered();
                debug!("{} connected: {connected}", entry.name);
            }
            entry.connected = connected;
        }
    }

    pub fn entry(&self, index: usize) -> Result<&PvEntry, PvError> {
        self.entries.get(index).ok_or(PvError::NoSuchEntry(index))
    }
    pub(crate) fn entry_mut(&mut self, index: usize) -> Result<&mut PvEntry, PvError> {
        self.entries.get_mut(index).ok_or(PvError::NoSuchEntry(index))
    }
    pub fn entries(&self) -> &[PvEntry] {
        &self.entries
    }
    /// The index of the first entry requested under `name`
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name.requested == name)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct channels behind the entries
    pub fn channel_count(&self) -> usize {
        self.grouper.channel_count()
    }
    pub fn groups(&self) -> &[ChannelGroup] {
        self.grouper.groups()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
    pub fn default_provider(&self) -> Provider {
        self.default_provider
    }

    pub fn is_limited_history(&self) -> bool {
        self.limited_history
    }
    /// Switch between keeping only the latest get reading and accumulating them
    pub fn set_limited_history(&mut self, limited: bool) {
        self.limited_history = limited;
        if limited {
            for entry in &mut self.entries {
                if entry.history.len() > 1 {
                    entry.history.drain(..entry.history.len() - 1);
                }
            }
        }
    }

    /// Drop every entry's get history
    pub fn clear_history(&mut self) {
        for entry in &mut self.entries {
            entry.history.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pvdata::nt_scalar, transports::MemoryTransport};

    fn table() -> PvTable<MemoryTransport> {
        PvTableBuilder::new()
            .connect_timeout(Duration::from_secs(1))
            .default_provider(Provider::Pva)
            .build(MemoryTransport::new())
    }

    #[test]
    fn names_share_slots() {
        let mut table = table();
        let indices = table
            .add_names(["MAG:I", "BPM1.x", "BPM1.y", "ca://BPM1.x"])
            .unwrap();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let slots: Vec<Slot> = table.entries().iter().map(PvEntry::slot).collect();
        assert_eq!(slots, vec![0, 1, 1, 2]);
        assert_eq!(table.entry(2).unwrap().sub_field(), Some("y"));
        assert_eq!(table.entry(3).unwrap().top_level(), "BPM1.x");
        assert_eq!(table.find("BPM1.y"), Some(2));
        assert_eq!(table.channel_count(), 3);
    }

    #[test]
    fn bad_name_adds_nothing() {
        let mut table = table();
        assert!(table.add_names(["A", "bogus://B"]).is_err());
        assert!(table.is_empty());
        assert!(matches!(table.entry(0), Err(PvError::NoSuchEntry(0))));
    }

    #[tokio::test]
    async fn connect_reports_entries() {
        let mut table = table();
        table
            .transport_mut()
            .add_pv("A", nt_scalar(1.0f64))
            .unwrap();
        table.add_names(["A", "A"]).unwrap();
        let report = table.connect().await;
        assert_eq!(report.connected, 2);
        assert!(report.all_connected());
        assert!(report.failures.is_empty());
    }
}
