//! The direct-indexed slot table and its lookup side-maps.
//!
//! One lock per slot; no operation holds two slot locks except the
//! explicitly ordered dual-lock helper used by transfers and trunk moves.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

use iax2_proto::constants::MAX_CALLS;

use super::CallSlot;

pub struct CallTable {
    slots: Vec<Mutex<Option<Box<CallSlot>>>>,
    /// (source address, the peer's call number) → our call number. Media
    /// frames only carry the sender's number; this resolves them.
    by_peer: Mutex<HashMap<(SocketAddr, u16), u16>>,
    /// Same, for media arriving on a transfer leg.
    by_transfer: Mutex<HashMap<(SocketAddr, u16), u16>>,
}

impl Default for CallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_CALLS);
        slots.resize_with(MAX_CALLS, || Mutex::new(None));
        Self {
            slots,
            by_peer: Mutex::new(HashMap::new()),
            by_transfer: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a freshly allocated slot.
    pub fn insert(&self, slot: CallSlot) {
        let callno = slot.callno as usize;
        debug_assert!(callno < MAX_CALLS);
        *self.slots[callno].lock() = Some(Box::new(slot));
    }

    /// Runs `f` with the slot locked, if it exists.
    pub fn with_slot<R>(&self, callno: u16, f: impl FnOnce(&mut CallSlot) -> R) -> Option<R> {
        let mut guard = self.slots.get(callno as usize)?.lock();
        guard.as_deref_mut().map(f)
    }

    /// Locks two slots in ascending call-number order and runs `f`.
    /// The ordering is what makes dual-slot operations (native bridges,
    /// trunk moves) deadlock-free.
    pub fn with_two_slots<R>(
        &self,
        a: u16,
        b: u16,
        f: impl FnOnce(&mut CallSlot, &mut CallSlot) -> R,
    ) -> Option<R> {
        if a == b || a as usize >= MAX_CALLS || b as usize >= MAX_CALLS {
            return None;
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let mut low_guard = self.slots[low as usize].lock();
        let mut high_guard = self.slots[high as usize].lock();
        match (low_guard.as_deref_mut(), high_guard.as_deref_mut()) {
            (Some(l), Some(h)) => {
                if a < b {
                    Some(f(l, h))
                } else {
                    Some(f(h, l))
                }
            }
            _ => None,
        }
    }

    /// Removes and returns the slot.
    pub fn take(&self, callno: u16) -> Option<Box<CallSlot>> {
        let slot = self.slots.get(callno as usize)?.lock().take()?;
        self.unlink(&slot);
        Some(slot)
    }

    pub fn exists(&self, callno: u16) -> bool {
        self.slots
            .get(callno as usize)
            .map(|s| s.lock().is_some())
            .unwrap_or(false)
    }

    /// Registers the (addr, peer callno) → callno mapping once the peer's
    /// number is learned.
    pub fn link_peer(&self, addr: SocketAddr, peer_callno: u16, callno: u16) {
        self.by_peer.lock().insert((addr, peer_callno), callno);
    }

    pub fn unlink_peer(&self, addr: SocketAddr, peer_callno: u16) {
        self.by_peer.lock().remove(&(addr, peer_callno));
    }

    pub fn find_by_peer(&self, addr: SocketAddr, peer_callno: u16) -> Option<u16> {
        self.by_peer.lock().get(&(addr, peer_callno)).copied()
    }

    pub fn link_transfer(&self, addr: SocketAddr, peer_callno: u16, callno: u16) {
        self.by_transfer.lock().insert((addr, peer_callno), callno);
    }

    pub fn find_by_transfer(&self, addr: SocketAddr, peer_callno: u16) -> Option<u16> {
        self.by_transfer.lock().get(&(addr, peer_callno)).copied()
    }

    fn unlink(&self, slot: &CallSlot) {
        if slot.peer_callno != 0 {
            self.by_peer.lock().remove(&(slot.addr, slot.peer_callno));
        }
        if let Some(taddr) = slot.transfer_addr {
            self.by_transfer
                .lock()
                .remove(&(taddr, slot.transfer_peer_callno));
        }
    }

    /// Transplants a slot to a new call number, both slot locks held in
    /// ascending index order for the whole move. Fails when the source is
    /// empty or the destination occupied.
    pub fn move_slot(&self, from: u16, to: u16) -> bool {
        if from == to || from as usize >= MAX_CALLS || to as usize >= MAX_CALLS {
            return false;
        }
        let (lo, hi) = if from < to { (from, to) } else { (to, from) };
        let mut lo_guard = self.slots[lo as usize].lock();
        let mut hi_guard = self.slots[hi as usize].lock();
        let (src, dst) = if from < to {
            (&mut lo_guard, &mut hi_guard)
        } else {
            (&mut hi_guard, &mut lo_guard)
        };
        if dst.is_some() {
            return false;
        }
        let Some(mut slot) = src.take() else {
            return false;
        };
        slot.callno = to;
        if slot.peer_callno != 0 {
            self.by_peer.lock().insert((slot.addr, slot.peer_callno), to);
        }
        if let Some(taddr) = slot.transfer_addr {
            self.by_transfer
                .lock()
                .insert((taddr, slot.transfer_peer_callno), to);
        }
        **dst = Some(slot);
        true
    }

    /// Every live call number. Used by shutdown and the CLI-free debug dump.
    pub fn live_callnos(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.lock().is_some() {
                out.push(idx as u16);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Direction, SlotKind};
    use std::time::Instant;

    fn addr() -> SocketAddr {
        "203.0.113.5:4569".parse().unwrap()
    }

    fn slot(callno: u16) -> CallSlot {
        CallSlot::new(callno, addr(), Direction::Inbound, SlotKind::Call, Instant::now())
    }

    #[test]
    fn insert_lookup_take() {
        let table = CallTable::new();
        table.insert(slot(100));
        assert!(table.exists(100));
        assert_eq!(table.with_slot(100, |s| s.callno), Some(100));
        let taken = table.take(100).unwrap();
        assert_eq!(taken.callno, 100);
        assert!(!table.exists(100));
    }

    #[test]
    fn peer_map_resolves_and_unlinks() {
        let table = CallTable::new();
        let mut s = slot(7);
        s.peer_callno = 99;
        table.insert(s);
        table.link_peer(addr(), 99, 7);
        assert_eq!(table.find_by_peer(addr(), 99), Some(7));
        table.take(7);
        assert_eq!(table.find_by_peer(addr(), 99), None);
    }

    #[test]
    fn dual_lock_orders_by_callno() {
        let table = CallTable::new();
        table.insert(slot(5));
        table.insert(slot(300));
        let got = table.with_two_slots(300, 5, |a, b| (a.callno, b.callno));
        assert_eq!(got, Some((300, 5)));
    }

    #[test]
    fn move_slot_rekeys_both_lookup_maps() {
        let table = CallTable::new();
        let taddr: SocketAddr = "203.0.113.77:4569".parse().unwrap();
        let mut s = slot(9);
        s.peer_callno = 42;
        s.transfer_addr = Some(taddr);
        s.transfer_peer_callno = 17;
        table.insert(s);
        table.link_peer(addr(), 42, 9);
        table.link_transfer(taddr, 17, 9);

        assert!(table.move_slot(9, 20_000));
        assert_eq!(table.with_slot(20_000, |s| s.callno), Some(20_000));
        assert_eq!(table.find_by_peer(addr(), 42), Some(20_000));
        assert_eq!(table.find_by_transfer(taddr, 17), Some(20_000));
    }
}
