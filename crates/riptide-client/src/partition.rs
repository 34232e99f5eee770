//! Per-partition stream state.
//!
//! The table is a fixed array of [`MAX_PARTITIONS`] slots, written by
//! the owning connection's dispatch task and read by everyone else.
//! Hot fields are atomics; the snapshot marker sits behind an
//! uncontended lock.

use crate::host::HostAndPort;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use riptide_protocol::FailoverLogEntry;

/// Upper bound on the number of partitions a bucket can have.
pub const MAX_PARTITIONS: usize = 1024;

/// The inclusive by-seqno window the server will emit next for a
/// partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarker {
    pub fn new(start_seqno: u64, end_seqno: u64, flags: u32) -> Self {
        Self {
            start_seqno,
            end_seqno,
            flags,
        }
    }
}

/// The resumable position of one partition stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOffset {
    pub vbuuid: u64,
    pub seqno: u64,
    pub snapshot: SnapshotMarker,
}

impl StreamOffset {
    pub fn new(vbuuid: u64, seqno: u64, snapshot: SnapshotMarker) -> Self {
        Self {
            vbuuid,
            seqno,
            snapshot,
        }
    }
}

impl fmt::Display for StreamOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}@{}[{}..{}]",
            self.vbuuid, self.seqno, self.snapshot.start_seqno, self.snapshot.end_seqno
        )
    }
}

/// Lifecycle of one partition stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Opening,
    Streaming,
    Ended,
    Failed,
}

impl StreamState {
    fn from_code(code: u32) -> Self {
        match code {
            1 => StreamState::Opening,
            2 => StreamState::Streaming,
            3 => StreamState::Ended,
            4 => StreamState::Failed,
            _ => StreamState::Idle,
        }
    }

    fn code(self) -> u32 {
        match self {
            StreamState::Idle => 0,
            StreamState::Opening => 1,
            StreamState::Streaming => 2,
            StreamState::Ended => 3,
            StreamState::Failed => 4,
        }
    }
}

struct Slot {
    vbuuid: AtomicU64,
    last_seqno: AtomicU64,
    state: AtomicU32,
    snapshot: RwLock<SnapshotMarker>,
    owner: Mutex<Option<HostAndPort>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            vbuuid: AtomicU64::new(0),
            last_seqno: AtomicU64::new(0),
            state: AtomicU32::new(StreamState::Idle.code()),
            snapshot: RwLock::new(SnapshotMarker::default()),
            owner: Mutex::new(None),
        }
    }
}

/// Fixed-capacity table of per-partition state, indexed by partition id.
pub struct PartitionStateTable {
    slots: Box<[Slot]>,
}

impl PartitionStateTable {
    pub fn new() -> Self {
        let slots: Vec<Slot> = (0..MAX_PARTITIONS).map(|_| Slot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    fn slot(&self, vbucket: u16) -> Option<&Slot> {
        self.slots.get(vbucket as usize)
    }

    pub fn state(&self, vbucket: u16) -> StreamState {
        self.slot(vbucket)
            .map(|s| StreamState::from_code(s.state.load(Ordering::Acquire)))
            .unwrap_or(StreamState::Idle)
    }

    pub fn set_state(&self, vbucket: u16, state: StreamState) {
        if let Some(slot) = self.slot(vbucket) {
            slot.state.store(state.code(), Ordering::Release);
        }
    }

    pub fn vbuuid(&self, vbucket: u16) -> u64 {
        self.slot(vbucket)
            .map(|s| s.vbuuid.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn set_vbuuid(&self, vbucket: u16, vbuuid: u64) {
        if let Some(slot) = self.slot(vbucket) {
            slot.vbuuid.store(vbuuid, Ordering::Release);
        }
    }

    pub fn last_seqno(&self, vbucket: u16) -> u64 {
        self.slot(vbucket)
            .map(|s| s.last_seqno.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn set_last_seqno(&self, vbucket: u16, seqno: u64) {
        if let Some(slot) = self.slot(vbucket) {
            slot.last_seqno.store(seqno, Ordering::Release);
        }
    }

    pub fn snapshot(&self, vbucket: u16) -> SnapshotMarker {
        self.slot(vbucket)
            .map(|s| *s.snapshot.read())
            .unwrap_or_default()
    }

    pub fn set_snapshot(&self, vbucket: u16, marker: SnapshotMarker) {
        if let Some(slot) = self.slot(vbucket) {
            *slot.snapshot.write() = marker;
        }
    }

    pub fn owner(&self, vbucket: u16) -> Option<HostAndPort> {
        self.slot(vbucket).and_then(|s| s.owner.lock().clone())
    }

    pub fn set_owner(&self, vbucket: u16, owner: Option<HostAndPort>) {
        if let Some(slot) = self.slot(vbucket) {
            *slot.owner.lock() = owner;
        }
    }

    /// The resumable offset assembled from this partition's slot.
    pub fn offset(&self, vbucket: u16) -> StreamOffset {
        StreamOffset {
            vbuuid: self.vbuuid(vbucket),
            seqno: self.last_seqno(vbucket),
            snapshot: self.snapshot(vbucket),
        }
    }

    /// Partitions currently owned by the given node.
    pub fn partitions_owned_by(&self, node: &HostAndPort) -> Vec<u16> {
        (0..self.slots.len() as u16)
            .filter(|vb| self.owner(*vb).as_ref() == Some(node))
            .collect()
    }
}

impl Default for PartitionStateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_table_defaults() {
        let table = PartitionStateTable::new();
        assert_eq!(table.state(42), StreamState::Idle);
        assert_eq!(table.vbuuid(42), 0);
        assert_eq!(table.offset(42), StreamOffset::default());
    }

    #[test]
    fn test_offset_reflects_slot_fields() {
        let table = PartitionStateTable::new();
        table.set_vbuuid(7, 0xAB);
        table.set_last_seqno(7, 150);
        table.set_snapshot(7, SnapshotMarker::new(100, 200, 1));

        let offset = table.offset(7);
        assert_eq!(offset.vbuuid, 0xAB);
        assert_eq!(offset.seqno, 150);
        assert_eq!(offset.snapshot, SnapshotMarker::new(100, 200, 1));
    }

    #[test]
    fn test_state_round_trips_all_variants() {
        let table = PartitionStateTable::new();
        for state in [
            StreamState::Idle,
            StreamState::Opening,
            StreamState::Streaming,
            StreamState::Ended,
            StreamState::Failed,
        ] {
            table.set_state(3, state);
            assert_eq!(table.state(3), state);
        }
    }

    #[test]
    fn test_out_of_range_partition_is_inert() {
        let table = PartitionStateTable::new();
        table.set_vbuuid(u16::MAX, 99);
        assert_eq!(table.vbuuid(u16::MAX), 0);
    }

    #[test]
    fn test_partitions_owned_by() {
        let table = PartitionStateTable::new();
        let node = HostAndPort::new("10.0.0.1", 11210);
        table.set_owner(1, Some(node.clone()));
        table.set_owner(5, Some(node.clone()));
        table.set_owner(9, Some(HostAndPort::new("10.0.0.2", 11210)));

        assert_eq!(table.partitions_owned_by(&node), vec![1, 5]);
    }
}
