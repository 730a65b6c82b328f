//! Emulator state and session bookkeeping
//!
//! Sessions live in a fixed slot array sized by the configured context
//! count. Established sessions are additionally reachable by their
//! assigned address through a small chained hash keyed with the address
//! pool's fold, so tunnelled payload can be routed without scanning.

use std::net::Ipv4Addr;
use std::time::Instant;

use sgsn_gtp::SessionHandle;
use sgsn_pool::{AddressPool, MemberId};

use crate::config::MAX_CONTEXTS;

/// Empty chain link
const NIL: usize = usize::MAX;

/// Coarse lifecycle of the emulator process as a whole.
///
/// The process moves forward only when every context has confirmed, and
/// any single failure sends it straight back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuState {
    /// Nothing established; the terminal state
    Idle,
    /// Create requests in flight
    WaitConnect,
    /// All contexts established
    Connected,
    /// Delete requests in flight
    WaitDisconnect,
}

/// One PDP context slot
#[derive(Debug)]
pub struct Session {
    /// Slot index, doubles as the NSAPI offered to the gateway
    pub index: usize,
    /// Protocol-layer token, set once the create request is issued
    pub handle: Option<SessionHandle>,
    /// Gateway-assigned end user address
    pub addr: Option<Ipv4Addr>,
    /// Claim on the local address pool, if the address fell inside it
    pub member: Option<MemberId>,
    /// Next slot in the same address hash bucket
    ip_next: usize,
}

/// Slot array with an address-keyed lookup chain
pub struct SessionTable {
    slots: Vec<Session>,
    hash: [usize; MAX_CONTEXTS],
}

impl SessionTable {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|index| Session {
                index,
                handle: None,
                addr: None,
                member: None,
                ip_next: NIL,
            })
            .collect();
        SessionTable {
            slots,
            hash: [NIL; MAX_CONTEXTS],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&Session> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Session> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter()
    }

    /// Slot that was handed the given protocol token
    pub fn by_handle(&self, handle: SessionHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.handle == Some(handle))
    }

    fn bucket(addr: Ipv4Addr) -> usize {
        sgsn_pool::hash4(addr) as usize % MAX_CONTEXTS
    }

    /// Record the assigned address and link the slot into its bucket
    pub fn bind_addr(&mut self, index: usize, addr: Ipv4Addr, member: Option<MemberId>) {
        let bucket = Self::bucket(addr);
        let head = self.hash[bucket];
        let slot = &mut self.slots[index];
        slot.addr = Some(addr);
        slot.member = member;
        slot.ip_next = head;
        self.hash[bucket] = index;
    }

    /// Drop the address binding; returns the released pool claim
    pub fn unbind_addr(&mut self, index: usize) -> Option<MemberId> {
        let addr = self.slots[index].addr.take()?;
        let member = self.slots[index].member.take();
        let bucket = Self::bucket(addr);
        let mut link = self.hash[bucket];
        if link == index {
            self.hash[bucket] = self.slots[index].ip_next;
        } else {
            while link != NIL {
                let next = self.slots[link].ip_next;
                if next == index {
                    self.slots[link].ip_next = self.slots[index].ip_next;
                    break;
                }
                link = next;
            }
        }
        self.slots[index].ip_next = NIL;
        member
    }

    /// Slot bound to the given address
    pub fn by_addr(&self, addr: Ipv4Addr) -> Option<usize> {
        let mut link = self.hash[Self::bucket(addr)];
        while link != NIL {
            if self.slots[link].addr == Some(addr) {
                return Some(link);
            }
            link = self.slots[link].ip_next;
        }
        None
    }

    /// Number of slots with an address bound
    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|s| s.addr.is_some()).count()
    }
}

/// Everything the event loop threads through the handlers
pub struct EmuContext {
    pub state: EmuState,
    pub pool: AddressPool,
    pub sessions: SessionTable,
    /// Process start, anchors the run time limit
    pub start: Instant,
}

impl EmuContext {
    pub fn new(pool: AddressPool, contexts: usize) -> Self {
        EmuContext {
            state: EmuState::Idle,
            pool,
            sessions: SessionTable::new(contexts),
            start: Instant::now(),
        }
    }
}
