//! Alarm registry: the ordered set behind `upsAlarmTable`.
//!
//! Mutations mark the registry dirty and queue pending traps; the snapshot's
//! alarm-table rebuild (`model::UpsState::apply_alarms`) consumes both. The
//! canonical caller pattern is `if !exists(X) { add(X) }` plus an
//! unconditional `remove_by_desc(X)`, so traps fire exactly on edges.

use crate::mib::Mib;
use crate::snmp::Oid;

/// One live alarm. `index` is the insertion ordinal within the current
/// registry and is not stable across `clear`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEntry {
    pub index: i32,
    pub oid: Oid,
    /// Centiseconds since agent start at detection time.
    pub time: u32,
}

/// Direction of an alarm-table edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Added,
    Removed,
}

/// A queued trap; holds copies of the entry fields so a later remove cannot
/// invalidate the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrap {
    pub kind: TrapKind,
    pub index: i32,
    pub alarm_oid: Oid,
}

impl PendingTrap {
    /// Resolve into a wire-level trap event. The trap and column symbols are
    /// fixed against the shipped MIB, so a lookup failure is a programming
    /// error.
    pub fn to_event(&self, mib: &Mib) -> crate::snmp::TrapEvent {
        let resolve = |name: &str| {
            mib.resolve(name)
                .unwrap_or_else(|e| panic!("trap OID lookup failed: {}", e))
        };
        let trap_name = match self.kind {
            TrapKind::Added => "upsTrapAlarmEntryAdded",
            TrapKind::Removed => "upsTrapAlarmEntryRemoved",
        };
        crate::snmp::TrapEvent {
            trap_oid: resolve(trap_name),
            alarm_id_oid: resolve("upsAlarmId"),
            alarm_descr_oid: resolve("upsAlarmDescr"),
            index: self.index,
            alarm_oid: self.alarm_oid.clone(),
        }
    }
}

/// Ordered alarm set with a dirty flag and a pending-trap queue.
#[derive(Debug, Default)]
pub struct AlarmTable {
    entries: Vec<AlarmEntry>,
    pending: Vec<PendingTrap>,
    dirty: bool,
}

impl AlarmTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AlarmEntry] {
        &self.entries
    }

    pub fn entry(&self, i: usize) -> Option<&AlarmEntry> {
        self.entries.get(i)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Drain the queued edge traps in order.
    pub fn take_pending(&mut self) -> Vec<PendingTrap> {
        std::mem::take(&mut self.pending)
    }

    /// A missing alarm symbol here is a programming error: every alarm name
    /// is hard-coded against the shipped MIB.
    fn resolve(mib: &Mib, name: &str) -> Oid {
        mib.resolve(name)
            .unwrap_or_else(|e| panic!("alarm OID lookup failed: {}", e))
    }

    pub fn exists(&self, mib: &Mib, name: &str) -> bool {
        let oid = Self::resolve(mib, name);
        self.entries.iter().any(|entry| entry.oid == oid)
    }

    /// Append a new entry and queue an `Added` trap. Returns the new index.
    pub fn add(&mut self, mib: &Mib, name: &str, now_ticks: u32) -> i32 {
        let oid = Self::resolve(mib, name);
        let index = self.entries.len() as i32;
        self.entries.push(AlarmEntry {
            index,
            oid: oid.clone(),
            time: now_ticks,
        });
        self.pending.push(PendingTrap {
            kind: TrapKind::Added,
            index,
            alarm_oid: oid,
        });
        self.dirty = true;
        index
    }

    /// Remove the first entry matching `name` and queue one `Removed` trap.
    /// Missing entries are a no-op.
    pub fn remove_by_desc(&mut self, mib: &Mib, name: &str) -> Option<i32> {
        let oid = Self::resolve(mib, name);
        let position = self.entries.iter().position(|entry| entry.oid == oid)?;
        let removed = self.entries.remove(position);
        self.pending.push(PendingTrap {
            kind: TrapKind::Removed,
            index: removed.index,
            alarm_oid: removed.oid,
        });
        self.dirty = true;
        Some(removed.index)
    }

    /// Empty the registry without queueing per-entry traps.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }
}
