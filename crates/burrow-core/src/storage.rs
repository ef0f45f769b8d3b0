use std::fmt;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

// StorageArena — The tensor tracker
//
// Every backend allocation is named by a DataId: a slot index in this arena
// plus the slot's generation. The arena is the single source of truth for
// which backend owns a storage cell, its dtype/shape/bytes, and how many
// logical tensor handles reference it.
//
// SLOT LIFECYCLE:
//
//   Vacant ──reserve()──► Reserved ──insert()──► Live ──retire()──► Vacant
//                             │                                      ▲
//                             └──────────release_reservation()───────┘
//
// Retiring a slot bumps its generation, so a stale DataId never matches a
// later allocation that reuses the same index.

/// Opaque handle naming one allocation inside exactly one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId {
    index: u32,
    generation: u32,
}

impl DataId {
    /// Slot index inside the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this id was minted.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Bookkeeping for one live storage cell.
#[derive(Debug, Clone)]
pub struct StorageRecord {
    /// Name of the backend that currently owns the storage.
    pub backend: String,
    pub dtype: DType,
    pub shape: Shape,
    /// Byte footprint counted towards `Engine::memory()`.
    pub bytes: usize,
    /// Number of live logical tensor handles referencing this storage.
    pub ref_count: usize,
    serial: u64,
}

impl StorageRecord {
    /// Allocation serial number, increasing across the arena's lifetime.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

#[derive(Debug)]
enum SlotState {
    Vacant,
    Reserved { serial: u64 },
    Live(StorageRecord),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
}

/// Arena of storage records indexed by generational [`DataId`]s.
#[derive(Debug, Default)]
pub struct StorageArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_serial: u64,
    num_live: usize,
    num_bytes: usize,
}

impl StorageArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh DataId. The slot stays reserved until [`insert`] makes it
    /// live or [`release_reservation`] hands it back.
    ///
    /// [`insert`]: StorageArena::insert
    /// [`release_reservation`]: StorageArena::release_reservation
    pub fn reserve(&mut self) -> DataId {
        let serial = self.next_serial;
        self.next_serial += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = SlotState::Reserved { serial };
            DataId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                state: SlotState::Reserved { serial },
            });
            DataId {
                index,
                generation: 0,
            }
        }
    }

    /// Return a reserved slot that never became live.
    pub fn release_reservation(&mut self, id: DataId) {
        if let Some(slot) = self.slot_mut(id) {
            if matches!(slot.state, SlotState::Reserved { .. }) {
                slot.state = SlotState::Vacant;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    /// Turn a reserved slot into a live record with a reference count of one.
    ///
    /// Fails if the id is stale, vacant, or already live: there is never more
    /// than one record per DataId.
    pub fn insert(
        &mut self,
        id: DataId,
        backend: &str,
        dtype: DType,
        shape: Shape,
        bytes: usize,
    ) -> Result<()> {
        let slot = self
            .slot_mut(id)
            .ok_or_else(|| Error::UnknownDataId(id.to_string()))?;
        let serial = match slot.state {
            SlotState::Reserved { serial } => serial,
            SlotState::Live(_) => {
                return Err(Error::msg(format!("data id {} is already tracked", id)));
            }
            SlotState::Vacant => return Err(Error::UnknownDataId(id.to_string())),
        };
        slot.state = SlotState::Live(StorageRecord {
            backend: backend.to_string(),
            dtype,
            shape,
            bytes,
            ref_count: 1,
            serial,
        });
        self.num_live += 1;
        self.num_bytes += bytes;
        Ok(())
    }

    /// Remove a live record, invalidating its DataId.
    pub fn retire(&mut self, id: DataId) -> Option<StorageRecord> {
        let slot = self.slot_mut(id)?;
        if !matches!(slot.state, SlotState::Live(_)) {
            return None;
        }
        let state = std::mem::replace(&mut slot.state, SlotState::Vacant);
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        match state {
            SlotState::Live(record) => {
                self.num_live -= 1;
                self.num_bytes -= record.bytes;
                Some(record)
            }
            _ => None,
        }
    }

    /// The live record for `id`, if any.
    pub fn get(&self, id: DataId) -> Option<&StorageRecord> {
        match self.slot(id).map(|s| &s.state) {
            Some(SlotState::Live(record)) => Some(record),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: DataId) -> Option<&mut StorageRecord> {
        match self.slot_mut(id).map(|s| &mut s.state) {
            Some(SlotState::Live(record)) => Some(record),
            _ => None,
        }
    }

    /// Like [`get`](StorageArena::get) but fails with `UnknownDataId`.
    pub fn record(&self, id: DataId) -> Result<&StorageRecord> {
        self.get(id)
            .ok_or_else(|| Error::UnknownDataId(id.to_string()))
    }

    /// Whether `id` names a live record.
    pub fn contains(&self, id: DataId) -> bool {
        self.get(id).is_some()
    }

    /// Whether `id` was minted but has not been inserted yet.
    pub fn is_reserved(&self, id: DataId) -> bool {
        matches!(
            self.slot(id).map(|s| &s.state),
            Some(SlotState::Reserved { .. })
        )
    }

    /// Allocation serial of a reserved or live slot.
    pub fn serial(&self, id: DataId) -> Option<u64> {
        match self.slot(id).map(|s| &s.state) {
            Some(SlotState::Reserved { serial }) => Some(*serial),
            Some(SlotState::Live(record)) => Some(record.serial),
            _ => None,
        }
    }

    /// The serial the next reservation will receive.
    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Replace the byte footprint of a live record.
    pub fn set_bytes(&mut self, id: DataId, bytes: usize) {
        let mut delta: Option<(usize, usize)> = None;
        if let Some(record) = self.get_mut(id) {
            delta = Some((record.bytes, bytes));
            record.bytes = bytes;
        }
        if let Some((old, new)) = delta {
            self.num_bytes = self.num_bytes - old + new;
        }
    }

    /// Number of live records.
    pub fn num_live(&self) -> usize {
        self.num_live
    }

    /// Sum of the byte footprints of all live records.
    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// Retire every record and drop every reservation.
    ///
    /// Generations keep counting, so ids handed out before the clear stay
    /// invalid afterwards.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !matches!(slot.state, SlotState::Vacant) {
                slot.state = SlotState::Vacant;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.num_live = 0;
        self.num_bytes = 0;
    }

    /// Ids of all live records.
    pub fn live_ids(&self) -> Vec<DataId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.state, SlotState::Live(_)))
            .map(|(i, s)| DataId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    fn slot(&self, id: DataId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    fn slot_mut(&mut self, id: DataId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }
}
