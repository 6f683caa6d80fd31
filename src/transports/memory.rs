use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

use crate::{
    name::Provider,
    pvdata::{NoSuchField, PvField, PvStructure, ScalarValue},
    transport::{Access, ChannelInfo, Monitor, Reply, Slot, Transport, TransportError},
    utils::wrapping_inplace_add,
};

/// Events queued per subscriber before it starts lagging
const MONITOR_CAPACITY: usize = 32;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("PV {0} already exists")]
pub struct PvAlreadyExists(pub String);

/// A write accepted by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub pv: String,
    pub field_path: String,
    pub value: PvField,
}

#[derive(Debug)]
struct HostedMonitor {
    id: u64,
    sub_field: Option<String>,
    sender: broadcast::Sender<PvStructure>,
    active: bool,
}

#[derive(Debug)]
struct HostedPv {
    value: PvStructure,
    reachable: bool,
    access: Access,
    monitors: Vec<HostedMonitor>,
}

impl HostedPv {
    fn event_for(&self, sub_field: Option<&str>) -> PvStructure {
        // Unknown sub-fields get the whole structure, for the client to report
        sub_field
            .and_then(|f| self.value.restrict(f))
            .unwrap_or_else(|| self.value.clone())
    }

    /// Send the current value to every active monitor, dropping any with no receivers
    fn notify(&mut self) {
        let events: Vec<Option<PvStructure>> = self
            .monitors
            .iter()
            .map(|m| m.active.then(|| self.event_for(m.sub_field.as_deref())))
            .collect();
        let mut events = events.into_iter();
        self.monitors.retain(|monitor| match events.next().flatten() {
            Some(event) => match monitor.sender.send(event) {
                Ok(_) => true,
                Err(_) => {
                    debug!("No more receivers for monitor {}: Cancelling", monitor.id);
                    false
                }
            },
            None => true,
        });
    }

    fn touch(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let _ = self.value.set_path(
            "timeStamp.secondsPastEpoch",
            ScalarValue::Long(now.as_secs() as i64).into(),
        );
        let _ = self.value.set_path(
            "timeStamp.nanoseconds",
            ScalarValue::Int(now.subsec_nanos() as i32).into(),
        );
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    pvs: HashMap<String, HostedPv>,
    channels: HashMap<Slot, (String, Provider)>,
    /// Opens that cannot complete yet. Holding the sender leaves the caller waiting.
    pending_opens: Vec<(String, Provider, oneshot::Sender<Result<ChannelInfo, TransportError>>)>,
    stalled_gets: Option<Vec<oneshot::Sender<Result<PvStructure, TransportError>>>>,
    stalled_puts: Option<Vec<oneshot::Sender<Result<(), TransportError>>>>,
    rejecting_puts: Option<String>,
    next_monitor_id: u64,
    opens: usize,
    gets: usize,
    puts: usize,
    writes: Vec<Write>,
}

impl MemoryState {
    fn connected_pv(&mut self, slot: Slot) -> Result<(&str, &mut HostedPv), TransportError> {
        let (name, _) = self
            .channels
            .get(&slot)
            .ok_or(TransportError::NoSuchChannel(slot))?;
        match self.pvs.get_mut(name) {
            Some(pv) if pv.reachable => Ok((name, pv)),
            _ => Err(TransportError::Disconnected),
        }
    }
}

fn channel_info(provider: Provider, access: Access) -> ChannelInfo {
    ChannelInfo {
        remote_address: Some(format!("{provider}://localhost")),
        access,
    }
}

/// A transport hosting its PVs in process.
///
/// Clones share the same PVs, so a test or demo can keep a handle to drive values and
/// faults while a table owns another. Every PV is reachable under both providers.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }

    pub fn add_pv(&mut self, name: &str, value: PvStructure) -> Result<(), PvAlreadyExists> {
        let mut state = self.state.lock().unwrap();
        if state.pvs.contains_key(name) {
            return Err(PvAlreadyExists(name.to_string()));
        }
        state.pvs.insert(
            name.to_string(),
            HostedPv {
                value,
                reachable: true,
                access: Access::ReadWrite,
                monitors: Vec::new(),
            },
        );
        Ok(())
    }

    /// Replace the field at `path` of a PV, notifying its monitors
    pub fn set_field(&self, name: &str, path: &str, value: PvField) -> Result<(), NoSuchField> {
        let mut state = self.state.lock().unwrap();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| NoSuchField(name.to_string()))?;
        pv.value.set_path(path, value)?;
        pv.touch();
        pv.notify();
        Ok(())
    }

    /// Replace the `value` field of a PV, notifying its monitors
    pub fn set_value(&self, name: &str, value: impl Into<PvField>) -> Result<(), NoSuchField> {
        self.set_field(name, "value", value.into())
    }

    /// Replace the whole structure of a PV, notifying its monitors
    pub fn replace(&self, name: &str, value: PvStructure) -> Result<(), NoSuchField> {
        let mut state = self.state.lock().unwrap();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| NoSuchField(name.to_string()))?;
        pv.value = value;
        pv.notify();
        Ok(())
    }

    pub fn value(&self, name: &str) -> Option<PvStructure> {
        let state = self.state.lock().unwrap();
        state.pvs.get(name).map(|pv| pv.value.clone())
    }

    /// Take a PV off or back on the network.
    ///
    /// Going down closes every monitor on the PV. Coming back up completes any opens
    /// that were still waiting on it.
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut state = self.state.lock().unwrap();
        let Some(pv) = state.pvs.get_mut(name) else {
            return;
        };
        debug!("Memory PV {name} reachable: {reachable}");
        pv.reachable = reachable;
        let access = pv.access;
        if !reachable {
            pv.monitors.clear();
            return;
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending_opens)
            .into_iter()
            .partition(|(pending, _, _)| pending == name);
        state.pending_opens = waiting;
        for (_, provider, reply) in ready {
            let _ = reply.send(Ok(channel_info(provider, access)));
        }
    }

    pub fn set_access(&self, name: &str, access: Access) {
        let mut state = self.state.lock().unwrap();
        if let Some(pv) = state.pvs.get_mut(name) {
            pv.access = access;
        }
    }

    /// Hold every get reply until unstalled, at which point the held gets fail
    pub fn stall_gets(&self, stall: bool) {
        let mut state = self.state.lock().unwrap();
        state.stalled_gets = stall.then(Vec::new);
    }

    /// Hold every put reply until unstalled, at which point the held puts fail
    pub fn stall_puts(&self, stall: bool) {
        let mut state = self.state.lock().unwrap();
        state.stalled_puts = stall.then(Vec::new);
    }

    /// Refuse every put with the given reason, or accept them again with `None`
    pub fn reject_puts(&self, reason: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.rejecting_puts = reason.map(str::to_string);
    }

    /// Number of channel opens requested
    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }
    /// Number of gets requested
    pub fn get_count(&self) -> usize {
        self.state.lock().unwrap().gets
    }
    /// Number of puts requested, whether or not they were accepted
    pub fn put_count(&self) -> usize {
        self.state.lock().unwrap().puts
    }
    /// Every accepted write, in order
    pub fn write_history(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }
    /// Number of live monitors that are delivering events
    pub fn active_monitor_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .pvs
            .values()
            .flat_map(|pv| pv.monitors.iter())
            .filter(|m| m.active && m.sender.receiver_count() > 0)
            .count()
    }
}

impl Transport for MemoryTransport {
    fn open_channel(&mut self, slot: Slot, name: &str, provider: Provider) -> Reply<ChannelInfo> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        state.channels.insert(slot, (name.to_string(), provider));
        match state.pvs.get(name) {
            Some(pv) if pv.reachable => {
                trace!("Opened {provider}://{name} on slot {slot}");
                let _ = tx.send(Ok(channel_info(provider, pv.access)));
            }
            _ => {
                debug!("{name} is not reachable, open left pending");
                state.pending_opens.push((name.to_string(), provider, tx));
            }
        }
        rx
    }

    fn is_connected(&self, slot: Slot) -> bool {
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(&slot)
            .and_then(|(name, _)| state.pvs.get(name))
            .is_some_and(|pv| pv.reachable)
    }

    fn channel_info(&self, slot: Slot) -> Option<ChannelInfo> {
        let state = self.state.lock().unwrap();
        let (name, provider) = state.channels.get(&slot)?;
        let pv = state.pvs.get(name).filter(|pv| pv.reachable)?;
        Some(channel_info(*provider, pv.access))
    }

    fn issue_get(&mut self, slot: Slot, sub_field: Option<&str>) -> Reply<PvStructure> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.gets += 1;
        let result = match state.connected_pv(slot) {
            Ok((_, pv)) if !pv.access.can_read() => {
                Err(TransportError::Rejected("no read access".to_string()))
            }
            Ok((_, pv)) => Ok(pv.event_for(sub_field)),
            Err(e) => Err(e),
        };
        match state.stalled_gets.as_mut() {
            Some(stalled) => stalled.push(tx),
            None => {
                let _ = tx.send(result);
            }
        }
        rx
    }

    fn issue_put(&mut self, slot: Slot, field_path: &str, value: PvField) -> Reply<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.puts += 1;
        if let Some(stalled) = state.stalled_puts.as_mut() {
            stalled.push(tx);
            return rx;
        }
        if let Some(reason) = state.rejecting_puts.clone() {
            let _ = tx.send(Err(TransportError::Rejected(reason)));
            return rx;
        }
        let mut accepted = None;
        let result = match state.connected_pv(slot) {
            Err(e) => Err(e),
            Ok((_, pv)) if !pv.access.can_write() => {
                Err(TransportError::Rejected("no write access".to_string()))
            }
            Ok((name, pv)) => match pv
                .value
                .get_path(field_path)
                .map(|existing| (existing.same_type_as(&value), existing.type_name()))
            {
                Some((true, _)) => {
                    debug!("Writing {name}.{field_path}: {value:?}");
                    let name = name.to_string();
                    let _ = pv.value.set_path(field_path, value.clone());
                    pv.touch();
                    pv.notify();
                    accepted = Some(Write {
                        pv: name,
                        field_path: field_path.to_string(),
                        value,
                    });
                    Ok(())
                }
                Some((false, existing)) => Err(TransportError::Rejected(format!(
                    "cannot store {} in {existing}",
                    value.type_name()
                ))),
                None => Err(TransportError::Rejected(format!("no field {field_path}"))),
            },
        };
        if let Some(write) = accepted {
            state.writes.push(write);
        }
        let _ = tx.send(result);
        rx
    }

    fn subscribe(
        &mut self,
        slot: Slot,
        sub_field: Option<&str>,
    ) -> Result<Monitor, TransportError> {
        let mut state = self.state.lock().unwrap();
        let id = wrapping_inplace_add(&mut state.next_monitor_id);
        let (name, pv) = state.connected_pv(slot)?;
        if !pv.access.can_read() {
            return Err(TransportError::Rejected("no read access".to_string()));
        }
        let (sender, events) = broadcast::channel(MONITOR_CAPACITY);
        let _ = sender.send(pv.event_for(sub_field));
        debug!("Monitor {id} subscribed to {name}");
        pv.monitors.push(HostedMonitor {
            id,
            sub_field: sub_field.map(str::to_string),
            sender,
            active: true,
        });
        Ok(Monitor { id, events })
    }

    fn set_monitor_active(&mut self, monitor: u64, active: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let hosted = state
            .pvs
            .values_mut()
            .flat_map(|pv| pv.monitors.iter_mut())
            .find(|m| m.id == monitor)
            .ok_or(TransportError::Closed)?;
        hosted.active = active;
        Ok(())
    }
}
