use tokio::time::{Instant, timeout_at};
use tracing::{debug, debug_span, trace, warn};

use crate::{
    dispatch,
    error::PvError,
    pvdata::PvStructure,
    reading::Reading,
    table::{PvEntry, PvTable},
    transport::{Transport, TransportError},
};

/// Outcome of a [`PvTable::get`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GetReport {
    /// Number of entries that took a new reading
    pub answered: usize,
    /// Indices of entries that were not connected, or did not answer in time
    pub not_connected: Vec<usize>,
}

impl PvEntry {
    /// Store a get reply in the history
    fn record_get(&mut self, structure: &PvStructure, limited: bool) -> Result<(), PvError> {
        self.classify_from(structure)?;
        let name = &self.name.requested;
        // Limited mode overwrites the single reading in place
        let element_count = if limited && !self.history.is_empty() {
            let reading = &mut self.history[0];
            dispatch::extract_into(structure, &self.shape, reading).map_err(|e| e.for_pv(name))?;
            reading.len()
        } else {
            let reading = dispatch::extract(structure, &self.shape).map_err(|e| e.for_pv(name))?;
            let count = reading.len();
            self.history.push(reading);
            count
        };
        self.absorb_metadata(structure, element_count);
        Ok(())
    }
}

impl<T: Transport> PvTable<T> {
    /// Read every connected entry once, appending to each history.
    ///
    /// Entries that are not connected, or that do not answer within the I/O timeout, are
    /// marked not connected and reported, without failing the call. Shape errors are
    /// gathered over the whole table and returned once every other entry is stored.
    pub async fn get(&mut self) -> Result<GetReport, PvError> {
        self.refresh_connections();
        let mut report = GetReport::default();
        let targets: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                if entry.connected {
                    Some(index)
                } else {
                    report.not_connected.push(index);
                    None
                }
            })
            .collect();

        let mut shape_errors = Vec::new();
        for (index, result) in self.fetch(&targets).await {
            let limited = self.limited_history;
            let entry = &mut self.entries[index];
            match result {
                Ok(structure) => match entry.record_get(&structure, limited) {
                    Ok(()) => report.answered += 1,
                    Err(e) => {
                        warn!("Get {}: {e}", entry.name);
                        shape_errors.push(e);
                    }
                },
                Err(e) => {
                    warn!("Get {}: {e}", entry.name);
                    entry.connected = false;
                    self.grouper.mark_disconnected(entry.slot);
                    report.not_connected.push(index);
                }
            }
        }
        report.not_connected.sort_unstable();
        debug!(
            "Get: {} answered, {} not connected",
            report.answered,
            report.not_connected.len()
        );
        PvError::from_batch(shape_errors)?;
        Ok(report)
    }

    /// Resolve the shape and choice list of entries without touching their history
    pub(crate) async fn resolve_shapes(&mut self, indices: &[usize]) -> Result<(), PvError> {
        let mut errors = Vec::new();
        for (index, result) in self.fetch(indices).await {
            let entry = &mut self.entries[index];
            let resolved = result.and_then(|structure| {
                entry.classify_from(&structure)?;
                entry.choices = dispatch::enum_choices(&structure, &entry.shape);
                Ok(())
            });
            if let Err(e) = resolved {
                errors.push(e);
            }
        }
        PvError::from_batch(errors)
    }

    /// Issue a read to every listed entry, then wait for all of them under one deadline
    async fn fetch(&mut self, indices: &[usize]) -> Vec<(usize, Result<PvStructure, PvError>)> {
        let deadline = Instant::now() + self.io_timeout;
        let mut pending = Vec::with_capacity(indices.len());
        for &index in indices {
            let entry = &self.entries[index];
            let _span = debug_span!("issue_get", index = index).entered();
            trace!("Reading {} from slot {}", entry.name, entry.slot);
            pending.push((
                index,
                self.transport.issue_get(entry.slot, entry.sub_field()),
            ));
        }

        let mut results = Vec::with_capacity(pending.len());
        for (index, reply) in pending {
            let name = || self.entries[index].name().to_string();
            let result = match timeout_at(deadline, reply).await {
                Ok(Ok(Ok(structure))) => Ok(structure),
                Ok(Ok(Err(source))) => Err(PvError::Transport {
                    name: name(),
                    source,
                }),
                Ok(Err(_)) => Err(PvError::Transport {
                    name: name(),
                    source: TransportError::Closed,
                }),
                Err(_) => Err(PvError::ReadTimeout(name())),
            };
            results.push((index, result));
        }
        results
    }

    /// Readings of every entry from the most recent get, `None` where there is none
    pub fn latest_readings(&self) -> Vec<Option<&Reading>> {
        self.entries.iter().map(PvEntry::latest).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        PvTableBuilder,
        pvdata::{PvStructure, ScalarValue, nt_enum, nt_scalar, nt_scalar_array},
        transports::MemoryTransport,
    };

    async fn connected_table(
        pvs: Vec<(&str, PvStructure)>,
        names: &[&str],
    ) -> PvTable<MemoryTransport> {
        let mut transport = MemoryTransport::new();
        for (name, value) in pvs {
            transport.add_pv(name, value).unwrap();
        }
        let mut table = PvTableBuilder::new()
            .connect_timeout(Duration::from_secs(1))
            .io_timeout(Duration::from_secs(1))
            .build(transport);
        table.add_names(names).unwrap();
        table.connect().await;
        table
    }

    #[tokio::test]
    async fn history_accumulates_or_is_limited() {
        let mut table = connected_table(vec![("A", nt_scalar(1.0f64))], &["A"]).await;
        for _ in 0..3 {
            table.get().await.unwrap();
        }
        assert_eq!(table.entry(0).unwrap().history().len(), 3);

        table.set_limited_history(true);
        assert_eq!(table.entry(0).unwrap().history().len(), 1);
        table
            .transport()
            .set_value("A", ScalarValue::Double(4.0))
            .unwrap();
        table.get().await.unwrap();
        table.get().await.unwrap();
        let entry = table.entry(0).unwrap();
        assert_eq!(entry.history().len(), 1);
        assert_eq!(entry.history()[0].values(), &[4.0]);

        table.clear_history();
        assert!(table.entry(0).unwrap().history().is_empty());
        assert_eq!(table.latest_readings(), vec![None]);
    }

    #[tokio::test]
    async fn metadata_follows_readings() {
        let mut table = connected_table(
            vec![("W", nt_scalar_array(vec![1.0f64, 2.0]).with_units("mA"))],
            &["W"],
        )
        .await;
        let report = table.get().await.unwrap();
        assert_eq!(report.answered, 1);
        let entry = table.entry(0).unwrap();
        assert_eq!(entry.units(), Some("mA"));
        assert!(entry.timestamp().is_some());
        assert_eq!(entry.element_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_soft() {
        let mut table = connected_table(
            vec![("A", nt_scalar(1i32)), ("B", nt_scalar(2i32))],
            &["A", "B"],
        )
        .await;
        table.transport().stall_gets(true);
        let report = table.get().await.unwrap();
        assert_eq!(report.answered, 0);
        assert_eq!(report.not_connected, vec![0, 1]);
        assert!(!table.entry(0).unwrap().is_connected());
        assert!(!table.grouper.is_connected(table.entry(1).unwrap().slot()));

        // The next get rechecks the transport and picks the entries back up
        table.transport().stall_gets(false);
        let report = table.get().await.unwrap();
        assert_eq!(report.answered, 2);
        assert_eq!(table.entry(1).unwrap().latest().unwrap().values(), &[2.0]);
        assert!(table.grouper.is_connected(table.entry(1).unwrap().slot()));
    }

    #[tokio::test]
    async fn enum_index_without_a_label() {
        let mut table = connected_table(vec![("C", nt_enum(-1, &["Off", "On"]))], &["C"]).await;
        table.get().await.unwrap();
        let reading = table.entry(0).unwrap().latest().unwrap();
        assert_eq!(reading.values(), &[-1.0]);
        assert_eq!(reading.text_values(), &["-1"]);
    }
}
