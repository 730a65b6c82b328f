//! Tunnel endpoint address pool
//!
//! Maps IPv4 addresses allocated for tunnel endpoints to member records.
//! The address space may be fragmented across several discontiguous CIDR
//! ranges, so members are kept in a hash table for uniform O(1) average
//! lookup, while free members are additionally chained into a doubly
//! linked list so dynamic allocation and release are O(1) as well.
//!
//! Members live in a flat arena and all chains (hash buckets, free list)
//! are stored as arena indices with `NIL` as the out-of-range sentinel.
//! The pool capacity is fixed at construction time; allocation and
//! release only toggle member state.

mod error;

pub use error::{PoolError, PoolResult};

use std::net::Ipv4Addr;

/// Exclude each range's network address from allocation
pub const POOL_NO_NETWORK: u32 = 0x01;

/// Exclude each range's broadcast address from allocation
pub const POOL_NO_BROADCAST: u32 = 0x02;

/// Upper bound on total pool capacity (guards against specs like 0.0.0.0/0)
pub const POOL_MAX_MEMBERS: u64 = 1 << 20;

/// Chain sentinel for "no member"
const NIL: usize = usize::MAX;

/// Deterministic avalanche hash of an IPv4 address.
///
/// Seedless integer mix so bucket placement is reproducible across runs;
/// also used by callers that need derived bucketing over the same key
/// space (e.g. the session table).
pub fn hash4(addr: Ipv4Addr) -> u32 {
    let mut h = u32::from(addr);
    h = (h ^ 61) ^ (h >> 16);
    h = h.wrapping_add(h << 3);
    h ^= h >> 4;
    h = h.wrapping_mul(0x27d4_eb2d);
    h ^= h >> 15;
    h
}

/// Stable identifier of a pool member (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(usize);

impl MemberId {
    /// Raw arena index
    pub fn index(self) -> usize {
        self.0
    }
}

/// One address in a configured range
#[derive(Debug)]
struct Member {
    addr: Ipv4Addr,
    /// Index of the CIDR range this member came from
    range: usize,
    in_use: bool,
    /// Hash bucket chain
    next_hash: usize,
    /// Free list chain, valid only while not in use
    prev: usize,
    next: usize,
}

/// A parsed CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl CidrRange {
    fn parse(token: &str) -> PoolResult<Self> {
        let (addr, prefix) = token
            .split_once('/')
            .ok_or_else(|| PoolError::InvalidSpec(format!("missing prefix length: {token}")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| PoolError::InvalidSpec(format!("bad network address: {token}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| PoolError::InvalidSpec(format!("bad prefix length: {token}")))?;
        if prefix > 32 {
            return Err(PoolError::InvalidSpec(format!(
                "prefix length out of range: {token}"
            )));
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        Ok(CidrRange {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// Number of addresses covered by the range
    fn size(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }
}

/// Address pool over one or more CIDR ranges
pub struct AddressPool {
    members: Vec<Member>,
    ranges: Vec<CidrRange>,
    /// Hash bucket heads, length is a power of two
    hash: Vec<usize>,
    hash_mask: usize,
    /// Free list head and tail, NIL iff the pool is exhausted
    first: usize,
    last: usize,
    free_count: usize,
}

impl AddressPool {
    /// Build a pool from whitespace-separated CIDR specifications,
    /// e.g. `"10.0.0.0/24 10.15.0.0/20"`.
    ///
    /// `flags` selects whether each range's network and/or broadcast
    /// address is excluded from allocation. The hash table size is the
    /// next power of two at or above the member count so the bucket
    /// index is a bitmask fold of the hash.
    pub fn new(spec: &str, flags: u32) -> PoolResult<Self> {
        let mut ranges = Vec::new();
        for token in spec.split_whitespace() {
            ranges.push(CidrRange::parse(token)?);
        }
        if ranges.is_empty() {
            return Err(PoolError::InvalidSpec("empty pool specification".into()));
        }

        let mut total: u64 = 0;
        for range in &ranges {
            let mut n = range.size();
            if n > 1 && (flags & POOL_NO_NETWORK) != 0 {
                n -= 1;
            }
            if n > 1 && (flags & POOL_NO_BROADCAST) != 0 {
                n -= 1;
            }
            total += n;
        }
        if total == 0 {
            return Err(PoolError::InvalidSpec(
                "pool specification yields no addresses".into(),
            ));
        }
        if total > POOL_MAX_MEMBERS {
            return Err(PoolError::InvalidSpec(format!(
                "pool too large: {total} addresses"
            )));
        }

        let hash_size = (total as usize).next_power_of_two();
        let mut pool = AddressPool {
            members: Vec::with_capacity(total as usize),
            ranges: ranges.clone(),
            hash: vec![NIL; hash_size],
            hash_mask: hash_size - 1,
            first: NIL,
            last: NIL,
            free_count: 0,
        };

        for (ri, range) in ranges.iter().enumerate() {
            let base = u32::from(range.network);
            let size = range.size();
            let skip_network = size > 1 && (flags & POOL_NO_NETWORK) != 0;
            let skip_broadcast = size > 1 && (flags & POOL_NO_BROADCAST) != 0;
            for offset in 0..size {
                if offset == 0 && skip_network {
                    continue;
                }
                if offset == size - 1 && skip_broadcast {
                    continue;
                }
                pool.push_member(Ipv4Addr::from(base + offset as u32), ri);
            }
        }

        log::debug!(
            "address pool: {} members in {} ranges, {} hash buckets",
            pool.members.len(),
            pool.ranges.len(),
            pool.hash.len()
        );
        Ok(pool)
    }

    fn push_member(&mut self, addr: Ipv4Addr, range: usize) {
        let id = self.members.len();
        let bucket = (hash4(addr) as usize) & self.hash_mask;
        self.members.push(Member {
            addr,
            range,
            in_use: false,
            next_hash: self.hash[bucket],
            prev: NIL,
            next: NIL,
        });
        self.hash[bucket] = id;
        self.link_free_tail(id);
    }

    /// Append a member at the free list tail
    fn link_free_tail(&mut self, id: usize) {
        self.members[id].next = NIL;
        self.members[id].prev = self.last;
        if self.last != NIL {
            self.members[self.last].next = id;
        } else {
            self.first = id;
        }
        self.last = id;
        self.free_count += 1;
    }

    /// Unlink a member from the free list
    fn unlink_free(&mut self, id: usize) {
        let (prev, next) = (self.members[id].prev, self.members[id].next);
        if prev != NIL {
            self.members[prev].next = next;
        } else {
            self.first = next;
        }
        if next != NIL {
            self.members[next].prev = prev;
        } else {
            self.last = prev;
        }
        self.members[id].prev = NIL;
        self.members[id].next = NIL;
        self.free_count -= 1;
    }

    /// Find a member by exact address
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<MemberId> {
        let bucket = (hash4(addr) as usize) & self.hash_mask;
        let mut id = self.hash[bucket];
        while id != NIL {
            if self.members[id].addr == addr {
                return Some(MemberId(id));
            }
            id = self.members[id].next_hash;
        }
        None
    }

    /// Allocate an address.
    ///
    /// The wildcard `0.0.0.0` requests any free address, served from the
    /// free list head. A specific address must be a pool member and not
    /// already allocated; it is unlinked from wherever it sits in the
    /// free list.
    pub fn allocate(&mut self, addr: Ipv4Addr) -> PoolResult<MemberId> {
        let id = if addr == Ipv4Addr::UNSPECIFIED {
            if self.first == NIL {
                return Err(PoolError::Exhausted);
            }
            self.first
        } else {
            let MemberId(id) = self.lookup(addr).ok_or(PoolError::NotFound)?;
            if self.members[id].in_use {
                return Err(PoolError::InUse);
            }
            id
        };
        self.unlink_free(id);
        self.members[id].in_use = true;
        Ok(MemberId(id))
    }

    /// Return a previously allocated member to the free list tail.
    /// The member stays reachable from its hash bucket.
    pub fn release(&mut self, id: MemberId) -> PoolResult<()> {
        let MemberId(id) = id;
        if !self.members[id].in_use {
            return Err(PoolError::NotInUse);
        }
        self.members[id].in_use = false;
        self.link_free_tail(id);
        Ok(())
    }

    /// Address of a member
    pub fn addr_of(&self, id: MemberId) -> Ipv4Addr {
        self.members[id.0].addr
    }

    /// Whether a member is currently allocated
    pub fn is_in_use(&self, id: MemberId) -> bool {
        self.members[id.0].in_use
    }

    /// Index of the CIDR range a member came from
    pub fn range_of(&self, id: MemberId) -> &CidrRange {
        &self.ranges[self.members[id.0].range]
    }

    /// Total member count (fixed at construction)
    pub fn capacity(&self) -> usize {
        self.members.len()
    }

    /// Number of members currently on the free list
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Hash table size (power of two)
    pub fn hash_size(&self) -> usize {
        self.hash.len()
    }
}
