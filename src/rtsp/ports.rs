use std::{collections::BTreeSet, sync::Arc};

use parking_lot::Mutex;

use crate::{error::MediaError, rtsp::transport::PortPair};

struct PortPool {
    first: u16,
    pairs: u16,
    next: u16,
    in_use: BTreeSet<u16>,
    total: u64,
}

/// Hands out even/odd RTP/RTCP server port pairs from a fixed range.
#[derive(Clone)]
pub struct PortAllocator {
    inner: Arc<Mutex<PortPool>>,
}

impl PortAllocator {
    /// `start..=end`; an odd `start` is rounded up to the next even port.
    pub fn new(start: u16, end: u16) -> Self {
        let first = start.saturating_add(start % 2);
        // a trailing even port without its odd partner is unusable
        let pairs = if end > first { (end - first - 1) / 2 + 1 } else { 0 };
        Self {
            inner: Arc::new(Mutex::new(PortPool {
                first,
                pairs,
                next: 0,
                in_use: BTreeSet::new(),
                total: 0,
            })),
        }
    }

    pub fn allocate(&self) -> Result<PortLease, MediaError> {
        let mut pool = self.inner.lock();
        for offset in 0..pool.pairs {
            let slot = (pool.next + offset) % pool.pairs;
            if pool.in_use.insert(slot) {
                pool.next = (slot + 1) % pool.pairs;
                pool.total += 1;
                let rtp = pool.first + slot * 2;
                return Ok(PortLease {
                    pool: self.clone(),
                    slot,
                    ports: PortPair::new(rtp, rtp + 1),
                });
            }
        }
        log::warn!("ports: all {} RTP port pairs in use", pool.pairs);
        Err(MediaError::ResourceExhausted("no free RTP port pair".into()))
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().pairs as usize
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    /// Pairs handed out since startup.
    pub fn total_allocations(&self) -> u64 {
        self.inner.lock().total
    }

    fn free(&self, slot: u16) {
        self.inner.lock().in_use.remove(&slot);
    }
}

/// A server port pair held by one track. Returned to the allocator on drop.
pub struct PortLease {
    pool: PortAllocator,
    slot: u16,
    ports: PortPair,
}

impl PortLease {
    pub fn ports(&self) -> PortPair {
        self.ports
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.free(self.slot);
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PortLease({})", self.ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_are_even_odd() {
        let ports = PortAllocator::new(50001, 50010);
        assert_eq!(ports.capacity(), 4);
        let lease = ports.allocate().unwrap();
        assert_eq!(lease.ports(), PortPair::new(50002, 50003));
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let ports = PortAllocator::new(6000, 6003);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_ne!(a.ports(), b.ports());
        assert!(matches!(ports.allocate(), Err(MediaError::ResourceExhausted(_))));

        drop(a);
        assert_eq!(ports.in_use(), 1);
        let c = ports.allocate().unwrap();
        assert_eq!(c.ports(), PortPair::new(6000, 6001));
        assert_eq!(ports.total_allocations(), 3);
    }

    #[test]
    fn test_round_robin_avoids_immediate_reuse() {
        let ports = PortAllocator::new(7000, 7005);
        let first = ports.allocate().unwrap().ports();
        let second = ports.allocate().unwrap().ports();
        assert_ne!(first, second);
    }

    #[test]
    fn test_empty_range() {
        let ports = PortAllocator::new(8000, 8000);
        assert_eq!(ports.capacity(), 0);
        assert!(ports.allocate().is_err());
    }
}
