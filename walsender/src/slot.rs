//! The fixed-size slot table: one entry per concurrently connected
//! standby, readable by the monitoring surface and writable only by the
//! sender task that owns it.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use utils::latch::Latch;
use utils::lsn::Lsn;

use crate::errors::SenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Startup,
    Backup,
    Catchup,
    Streaming,
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub peer_addr: SocketAddr,
    pub state: SenderState,
    pub sent_lsn: Lsn,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub apply_lsn: Lsn,
}

impl SlotInfo {
    fn new(peer_addr: SocketAddr) -> SlotInfo {
        SlotInfo {
            peer_addr,
            state: SenderState::Startup,
            sent_lsn: Lsn::INVALID,
            write_lsn: Lsn::INVALID,
            flush_lsn: Lsn::INVALID,
            apply_lsn: Lsn::INVALID,
        }
    }
}

struct Slot {
    info: Option<SlotInfo>,
    latch: Latch,
}

pub struct SlotTable {
    slots: Vec<Mutex<Slot>>,
}

pub type SlotId = usize;

impl SlotTable {
    pub fn new(capacity: usize) -> Arc<SlotTable> {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Mutex::new(Slot {
                info: None,
                latch: Latch::new(),
            }));
        }
        Arc::new(SlotTable { slots })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot for a newly accepted connection. The
    /// returned guard deregisters the slot when dropped, so every
    /// early-return or panic path in the connection task still frees it.
    pub fn register(
        self: &Arc<Self>,
        peer_addr: SocketAddr,
    ) -> Result<SlotGuard, SenderError> {
        for (id, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.info.is_none() {
                guard.info = Some(SlotInfo::new(peer_addr));
                crate::metrics::ACTIVE_SENDERS.inc();
                return Ok(SlotGuard {
                    table: Arc::clone(self),
                    id,
                });
            }
        }
        Err(SenderError::TooManySenders)
    }

    pub fn update<F: FnOnce(&mut SlotInfo)>(&self, id: SlotId, f: F) {
        let mut slot = self.slots[id].lock();
        if let Some(info) = slot.info.as_mut() {
            f(info);
        }
    }

    pub fn get_all(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().info.clone())
            .collect()
    }

    /// The minimum sent LSN across every occupied slot, i.e. the position
    /// the slowest standby has not yet received. Used to decide how much
    /// WAL is still needed by *someone* downstream.
    pub fn laggard_sent_lsn(&self) -> Option<Lsn> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().info.as_ref().map(|i| i.sent_lsn))
            .filter(|lsn| lsn.is_valid())
            .min()
    }

    fn unregister(&self, id: SlotId) {
        let mut slot = self.slots[id].lock();
        slot.info = None;
    }

    /// Wake every occupied slot's latch, e.g. after the flush pointer
    /// advances.
    pub fn wake_all(&self) {
        for slot in self.slots.iter() {
            let guard = slot.lock();
            if guard.info.is_some() {
                guard.latch.set();
            }
        }
    }

    fn latch(&self, id: SlotId) -> Latch {
        self.slots[id].lock().latch.clone()
    }
}

/// RAII handle to a registered slot; deregisters on drop.
pub struct SlotGuard {
    table: Arc<SlotTable>,
    id: SlotId,
}

impl SlotGuard {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn update<F: FnOnce(&mut SlotInfo)>(&self, f: F) {
        self.table.update(self.id, f);
    }

    pub fn latch(&self) -> Latch {
        self.table.latch(self.id)
    }

    pub fn table(&self) -> &Arc<SlotTable> {
        &self.table
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.unregister(self.id);
        crate::metrics::ACTIVE_SENDERS.dec();
        crate::metrics::CAUGHT_UP.remove_label_values(&[&self.id.to_string()]).ok();
    }
}
