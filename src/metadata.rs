//! Read-only introspection of table entries.
//!
//! Everything here reports what was learned from the channel and the most recent
//! reading. Asking about an entry that is not connected, or does not exist, is not an
//! error: the answer is [`UNKNOWN`], empty, zero or false.

use std::fmt;

use crate::{
    table::{PvEntry, PvTable},
    transport::Transport,
};

/// Reported for text metadata that is not available
pub const UNKNOWN: &str = "unknown";

/// A snapshot of everything known about one entry
#[derive(Debug, Clone, PartialEq)]
pub struct PvInfo {
    pub name: String,
    pub provider: String,
    pub remote_address: String,
    pub can_read: bool,
    pub can_write: bool,
    pub structure_id: String,
    pub field_type: String,
    pub native_type: String,
    pub element_count: usize,
    pub units: String,
    pub choices: Vec<String>,
}

impl fmt::Display for PvInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "    provider:  {}", self.provider)?;
        writeln!(f, "    server:    {}", self.remote_address)?;
        writeln!(
            f,
            "    access:    {}{}",
            if self.can_read { "read " } else { "" },
            if self.can_write { "write" } else { "" }
        )?;
        writeln!(f, "    structure: {}", self.structure_id)?;
        writeln!(
            f,
            "    field:     {} of {} x {}",
            self.field_type, self.element_count, self.native_type
        )?;
        if !self.units.is_empty() {
            writeln!(f, "    units:     {}", self.units)?;
        }
        if !self.choices.is_empty() {
            writeln!(f, "    choices:   {}", self.choices.join(", "))?;
        }
        Ok(())
    }
}

impl<T: Transport> PvTable<T> {
    fn connected_entry(&self, index: usize) -> Option<&PvEntry> {
        self.entries.get(index).filter(|e| e.connected)
    }

    pub fn provider_name(&self, index: usize) -> &'static str {
        self.entries
            .get(index)
            .map_or(UNKNOWN, |e| e.provider().name())
    }

    /// Where the entry's channel is served from
    pub fn remote_address(&self, index: usize) -> &str {
        self.connected_entry(index)
            .and_then(|e| self.grouper.info(e.slot))
            .and_then(|info| info.remote_address.as_deref())
            .unwrap_or(UNKNOWN)
    }

    pub fn can_read(&self, index: usize) -> bool {
        self.connected_entry(index)
            .and_then(|e| self.grouper.info(e.slot))
            .is_some_and(|info| info.access.can_read())
    }

    pub fn can_write(&self, index: usize) -> bool {
        self.connected_entry(index)
            .and_then(|e| self.grouper.info(e.slot))
            .is_some_and(|info| info.access.can_write())
    }

    /// The type identifier of the last structure received, e.g. `epics:nt/NTScalar:1.0`
    pub fn structure_id(&self, index: usize) -> &str {
        self.connected_entry(index)
            .and_then(|e| e.structure_id.as_deref())
            .unwrap_or(UNKNOWN)
    }

    /// The introspection type of the value field: `scalar`, `scalarArray` or `structure`
    pub fn field_type(&self, index: usize) -> &'static str {
        self.connected_entry(index)
            .and_then(|e| e.shape.field_type_name())
            .unwrap_or(UNKNOWN)
    }

    /// Number of elements in the last reading
    pub fn element_count(&self, index: usize) -> usize {
        self.connected_entry(index).map_or(0, |e| e.element_count)
    }

    /// The scalar type of the value's elements. Enumerated values report `int`.
    pub fn native_type(&self, index: usize) -> &'static str {
        self.connected_entry(index)
            .and_then(PvEntry::element_scalar_type)
            .map_or(UNKNOWN, |t| t.name())
    }

    pub fn units(&self, index: usize) -> &str {
        self.connected_entry(index)
            .and_then(PvEntry::units)
            .unwrap_or_default()
    }

    /// The labels an enumerated value can take, as used to match labels on put
    pub fn enum_choices(&self, index: usize) -> &[String] {
        self.connected_entry(index)
            .map(|e| e.choices.as_slice())
            .unwrap_or_default()
    }

    pub fn info(&self, index: usize) -> PvInfo {
        PvInfo {
            name: self
                .entries
                .get(index)
                .map_or(UNKNOWN, PvEntry::name)
                .to_string(),
            provider: self.provider_name(index).to_string(),
            remote_address: self.remote_address(index).to_string(),
            can_read: self.can_read(index),
            can_write: self.can_write(index),
            structure_id: self.structure_id(index).to_string(),
            field_type: self.field_type(index).to_string(),
            native_type: self.native_type(index).to_string(),
            element_count: self.element_count(index),
            units: self.units(index).to_string(),
            choices: self.enum_choices(index).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        PvTableBuilder,
        pvdata::{nt_enum, nt_scalar_array},
        transport::Access,
        transports::MemoryTransport,
    };

    #[tokio::test(start_paused = true)]
    async fn introspection() {
        let mut transport = MemoryTransport::new();
        transport
            .add_pv("W", nt_scalar_array(vec![1u16, 2, 3]).with_units("V"))
            .unwrap();
        transport.add_pv("E", nt_enum(0, &["Off", "On"])).unwrap();
        transport.add_pv("DOWN", nt_enum(0, &["Off", "On"])).unwrap();
        transport.set_access("E", Access::Read);
        transport.set_reachable("DOWN", false);
        let mut table = PvTableBuilder::new()
            .connect_timeout(Duration::from_secs(1))
            .build(transport);
        table.add_names(["W", "E", "ca://DOWN"]).unwrap();
        table.connect().await;
        table.get().await.unwrap();

        assert_eq!(table.provider_name(0), "pva");
        assert_eq!(table.remote_address(0), "pva://localhost");
        assert!(table.can_read(0) && table.can_write(0));
        assert_eq!(table.structure_id(0), "epics:nt/NTScalarArray:1.0");
        assert_eq!(table.field_type(0), "scalarArray");
        assert_eq!(table.native_type(0), "ushort");
        assert_eq!(table.element_count(0), 3);
        assert_eq!(table.units(0), "V");

        assert!(table.can_read(1) && !table.can_write(1));
        assert_eq!(table.field_type(1), "structure");
        assert_eq!(table.enum_choices(1), &["Off", "On"]);

        let info = table.info(2);
        assert_eq!(info.provider, "ca");
        assert_eq!(info.remote_address, UNKNOWN);
        assert_eq!(info.element_count, 0);
        assert!(info.choices.is_empty() && !info.can_read);
        assert_eq!(table.info(9).name, UNKNOWN);
        assert!(table.info(1).to_string().contains("choices:   Off, On"));
    }
}
