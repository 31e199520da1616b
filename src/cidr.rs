//! Bitmap allocation of node-sized subnets out of the cluster supernet.

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::net::Ipv4Addr;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("subnet range exhausted")]
    Exhausted,

    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("CIDR {0} is outside the cluster range")]
    OutOfRange(String),

    #[error("node mask /{node} must be longer than the cluster mask /{cluster}")]
    InvalidMask { cluster: u8, node: u8 },
}

/// Hands out `/N` blocks of the cluster supernet, each bound to at most one
/// node at a time.
///
/// The bitmap and cursor live behind a single lock that is never held across
/// I/O; a linear probe starting at the cursor keeps allocation first-fit
/// while spreading fresh allocations away from just-released slots.
#[derive(Debug)]
pub struct CidrAllocator {
    supernet: Ipv4Net,
    node_prefix: u8,
    total: usize,
    state: Mutex<State>,
}

#[cfg(test)]
impl PartialEq for CidrAllocator {
    fn eq(&self, other: &Self) -> bool {
        self.supernet == other.supernet
            && self.node_prefix == other.node_prefix
            && self.total == other.total
    }
}

#[derive(Debug)]
struct State {
    bits: Vec<bool>,
    next: usize,
}

// === impl CidrAllocator ===

impl CidrAllocator {
    pub fn new(supernet: Ipv4Net, node_prefix: u8) -> Result<Self, Error> {
        let supernet = supernet.trunc();
        if node_prefix <= supernet.prefix_len() || node_prefix > 32 {
            return Err(Error::InvalidMask {
                cluster: supernet.prefix_len(),
                node: node_prefix,
            });
        }

        let total = 1usize << (node_prefix - supernet.prefix_len());
        Ok(Self {
            supernet,
            node_prefix,
            total,
            state: Mutex::new(State {
                bits: vec![false; total],
                next: 0,
            }),
        })
    }

    /// The number of `/N` blocks the supernet holds.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Claims the first free block at or after the cursor, wrapping once.
    pub fn allocate_next(&self) -> Result<String, Error> {
        let mut state = self.state.lock();
        for i in 0..self.total {
            let idx = (state.next + i) % self.total;
            if !state.bits[idx] {
                state.bits[idx] = true;
                state.next = (idx + 1) % self.total;
                return Ok(self.cidr_at(idx));
            }
        }
        Err(Error::Exhausted)
    }

    /// Reserves a block that was assigned out of band. Re-marking an already
    /// allocated block is not an error.
    pub fn mark_allocated(&self, cidr: &str) -> Result<(), Error> {
        let idx = self.index_of(cidr)?;
        self.state.lock().bits[idx] = true;
        Ok(())
    }

    /// Returns a block to the free pool. The cursor rewinds to the freed slot
    /// so it is reused before the probe wraps.
    pub fn release(&self, cidr: &str) -> Result<(), Error> {
        let idx = self.index_of(cidr)?;
        let mut state = self.state.lock();
        state.bits[idx] = false;
        if idx < state.next {
            state.next = idx;
        }
        Ok(())
    }

    /// Whether the block is currently bound. Malformed or foreign CIDRs are
    /// simply not allocated.
    pub fn is_allocated(&self, cidr: &str) -> bool {
        match self.index_of(cidr) {
            Ok(idx) => self.state.lock().bits[idx],
            Err(_) => false,
        }
    }

    fn cidr_at(&self, idx: usize) -> String {
        let base = u32::from(self.supernet.network());
        let addr = Ipv4Addr::from(base + ((idx as u32) << (32 - self.node_prefix)));
        format!("{}/{}", addr, self.node_prefix)
    }

    fn index_of(&self, cidr: &str) -> Result<usize, Error> {
        let net = cidr
            .parse::<Ipv4Net>()
            .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;

        if net.prefix_len() != self.node_prefix || !self.supernet.contains(&net.addr()) {
            return Err(Error::OutOfRange(cidr.to_string()));
        }

        let base = u32::from(self.supernet.network());
        let idx = ((u32::from(net.addr()) - base) >> (32 - self.node_prefix)) as usize;
        if idx >= self.total {
            return Err(Error::OutOfRange(cidr.to_string()));
        }
        Ok(idx)
    }
}
