use tokio::time::{Instant, timeout_at};
use tracing::{debug, debug_span, trace, warn};

use crate::{
    dispatch,
    error::PvError,
    reading::Reading,
    table::PvTable,
    transport::Transport,
};

impl<T: Transport> PvTable<T> {
    /// Stage a value to be written by the next [`PvTable::put`]
    pub fn stage_put(&mut self, index: usize, value: impl Into<Reading>) -> Result<(), PvError> {
        let value = value.into();
        let entry = self.entry_mut(index)?;
        if value.is_empty() {
            return Err(PvError::NothingToPut(entry.name().to_string()));
        }
        entry.put_buffer = Some(value);
        Ok(())
    }

    /// Withdraw a staged value, returning it
    pub fn cancel_put(&mut self, index: usize) -> Result<Option<Reading>, PvError> {
        Ok(self.entry_mut(index)?.put_buffer.take())
    }

    /// Write every staged value, returning how many were written.
    ///
    /// Nothing is written unless every staged entry is connected and every staged value
    /// converts to its PV's shape. Each acknowledged write releases its staged value;
    /// writes that fail keep theirs, and are reported together.
    pub async fn put(&mut self) -> Result<usize, PvError> {
        let staged: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.put_buffer.is_some())
            .map(|(index, _)| index)
            .collect();
        if staged.is_empty() {
            return Ok(0);
        }
        self.refresh_connections();
        if let Some(entry) = staged
            .iter()
            .map(|&index| &self.entries[index])
            .find(|e| !e.connected)
        {
            return Err(PvError::NotConnected(entry.name().to_string()));
        }

        let unresolved: Vec<usize> = staged
            .iter()
            .copied()
            .filter(|&index| !self.entries[index].shape.is_classified())
            .collect();
        if !unresolved.is_empty() {
            debug!("Resolving shape of {} entries before put", unresolved.len());
            self.resolve_shapes(&unresolved).await?;
        }

        // Convert everything before anything goes out
        let mut writes = Vec::with_capacity(staged.len());
        let mut errors = Vec::new();
        for &index in &staged {
            let entry = &self.entries[index];
            let Some(value) = entry.put_buffer.as_ref() else {
                continue;
            };
            match dispatch::inject(&entry.shape, value, &entry.choices) {
                Ok(write) => writes.push((index, write)),
                Err(e) => errors.push(e.for_pv(entry.name())),
            }
        }
        PvError::from_batch(errors)?;

        let deadline = Instant::now() + self.io_timeout;
        let mut pending = Vec::with_capacity(writes.len());
        for (index, (field_path, value)) in writes {
            let slot = self.entries[index].slot;
            let _span = debug_span!("issue_put", index = index).entered();
            trace!("Writing {field_path} on slot {slot}: {value:?}");
            pending.push((index, self.transport.issue_put(slot, &field_path, value)));
        }

        let mut written = 0;
        let mut failed = Vec::new();
        for (index, reply) in pending {
            let result = match timeout_at(deadline, reply).await {
                Ok(Ok(result)) => result.map_err(|e| e.to_string()),
                Ok(Err(_)) => Err("no reply".to_string()),
                Err(_) => Err("timed out".to_string()),
            };
            let entry = &mut self.entries[index];
            match result {
                Ok(()) => {
                    entry.put_buffer = None;
                    written += 1;
                }
                Err(reason) => {
                    warn!("Put {} failed: {reason}", entry.name);
                    failed.push(entry.name().to_string());
                }
            }
        }
        if !failed.is_empty() {
            return Err(PvError::WriteFailed { names: failed });
        }
        debug!("Put: wrote {written} entries");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        PvTableBuilder,
        pvdata::{PvField, ScalarValue, nt_enum, nt_scalar},
        transports::MemoryTransport,
    };

    async fn table_with(transport: MemoryTransport, names: &[&str]) -> PvTable<MemoryTransport> {
        let mut table = PvTableBuilder::new()
            .connect_timeout(Duration::from_secs(1))
            .io_timeout(Duration::from_secs(1))
            .build(transport);
        table.add_names(names).unwrap();
        table.connect().await;
        table
    }

    #[tokio::test]
    async fn put_without_get_resolves_shape() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i16)).unwrap();
        let mut table = table_with(transport.clone(), &["A"]).await;

        table.stage_put(0, "12").unwrap();
        assert_eq!(table.entry(0).unwrap().pending_put_count(), 1);
        assert_eq!(table.put().await.unwrap(), 1);
        assert_eq!(table.entry(0).unwrap().pending_put(), None);
        // Resolving the shape does not take a reading
        assert!(table.entry(0).unwrap().history().is_empty());
        assert_eq!(
            transport.value("A").unwrap().get_path("value"),
            Some(&PvField::Scalar(ScalarValue::Short(12)))
        );
        assert_eq!(table.put().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_values_write_nothing() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i32)).unwrap();
        transport.add_pv("E", nt_enum(0, &["Off", "On"])).unwrap();
        let mut table = table_with(transport.clone(), &["A", "E"]).await;
        table.get().await.unwrap();

        table.stage_put(0, 5.0).unwrap();
        table.stage_put(1, "Maybe").unwrap();
        let err = table.put().await.unwrap_err();
        assert!(matches!(err, PvError::ShapeMismatch { ref name, .. } if name == "E"));
        assert_eq!(transport.put_count(), 0);
        // Both stay staged
        assert_eq!(table.entry(0).unwrap().pending_put_count(), 1);

        assert!(table.cancel_put(1).unwrap().is_some());
        assert_eq!(table.put().await.unwrap(), 1);
        assert!(matches!(
            table.stage_put(0, Vec::<f64>::new()),
            Err(PvError::NothingToPut(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_keep_their_values() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i32)).unwrap();
        transport.add_pv("B", nt_scalar(0i32)).unwrap();
        let mut table = table_with(transport.clone(), &["A", "B"]).await;
        table.get().await.unwrap();

        table.stage_put(0, 1).unwrap();
        table.stage_put(1, 2).unwrap();
        transport.reject_puts(Some("read only"));
        assert_eq!(
            table.put().await,
            Err(PvError::WriteFailed {
                names: vec!["A".to_string(), "B".to_string()]
            })
        );
        assert_eq!(table.entry(1).unwrap().pending_put_count(), 1);

        transport.reject_puts(None);
        transport.stall_puts(true);
        assert!(matches!(
            table.put().await,
            Err(PvError::WriteFailed { .. })
        ));
        transport.stall_puts(false);
        assert_eq!(table.put().await.unwrap(), 2);
        assert_eq!(transport.write_history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unconnected_entries_block_the_put() {
        let mut transport = MemoryTransport::new();
        transport.add_pv("A", nt_scalar(0i32)).unwrap();
        transport.add_pv("B", nt_scalar(0i32)).unwrap();
        transport.set_reachable("B", false);
        let mut table = table_with(transport.clone(), &["A", "B"]).await;

        table.stage_put(0, 1).unwrap();
        table.stage_put(1, 1).unwrap();
        assert_eq!(
            table.put().await,
            Err(PvError::NotConnected("B".to_string()))
        );
        assert_eq!(transport.put_count(), 0);
    }
}
