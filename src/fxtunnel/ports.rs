use std::{
    collections::{BTreeSet, VecDeque},
    time::{Duration, Instant},
};

use thiserror::Error;

/// How long a freed port stays unusable. NATs can hold half-open entries for
/// a while; handing the port to a new tunnel too early would deliver traffic
/// meant for the previous owner. The delay is a queue with deadlines, not a
/// sleep.
pub const PORT_COOLDOWN: Duration = Duration::from_secs(5);

impl Default for PortAllocator {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port range exhausted")]
    Exhausted,
    #[error("port {0} is not available")]
    Unavailable(u16),
    #[error("port {0} is outside the configured range")]
    OutOfRange(u16),
}

/// Allocator over one closed port range with deterministic lowest-free draw.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    free: BTreeSet<u16>,
    cooling: VecDeque<(Instant, u16)>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            free: (min..=max).collect(),
            cooling: VecDeque::new(),
        }
    }

    /// Allocator with no usable range; every draw reports exhaustion.
    pub fn empty() -> Self {
        Self {
            min: 1,
            max: 0,
            free: BTreeSet::new(),
            cooling: VecDeque::new(),
        }
    }

    /// Draw the lowest free port, or claim `desired` when it is free.
    pub fn alloc(&mut self, desired: Option<u16>) -> Result<u16, PortError> {
        self.promote_cooled(Instant::now());

        if let Some(p) = desired {
            if p < self.min || p > self.max {
                return Err(PortError::OutOfRange(p));
            }
            if !self.free.remove(&p) {
                return Err(PortError::Unavailable(p));
            }
            return Ok(p);
        }

        let Some(&p) = self.free.iter().next() else {
            return Err(PortError::Exhausted);
        };
        self.free.remove(&p);
        Ok(p)
    }

    /// Return a port; it becomes allocatable again after the cool-down.
    pub fn release(&mut self, port: u16) {
        if port < self.min || port > self.max {
            return;
        }
        if self.free.contains(&port) || self.cooling.iter().any(|&(_, p)| p == port) {
            return;
        }
        self.cooling.push_back((Instant::now() + PORT_COOLDOWN, port));
    }

    fn promote_cooled(&mut self, now: Instant) {
        while let Some(&(deadline, port)) = self.cooling.front() {
            if deadline > now {
                break;
            }
            self.cooling.pop_front();
            self.free.insert(port);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[cfg(test)]
    fn promote_all_for_test(&mut self) {
        while let Some((_, port)) = self.cooling.pop_front() {
            self.free.insert(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_lowest_free_first() {
        let mut a = PortAllocator::new(10000, 10001);
        assert_eq!(a.alloc(None).unwrap(), 10000);
        assert_eq!(a.alloc(None).unwrap(), 10001);
        assert_eq!(a.alloc(None).unwrap_err(), PortError::Exhausted);
    }

    #[test]
    fn desired_port_claimed_when_free() {
        let mut a = PortAllocator::new(10000, 10005);
        assert_eq!(a.alloc(Some(10003)).unwrap(), 10003);
        assert_eq!(a.alloc(Some(10003)).unwrap_err(), PortError::Unavailable(10003));
        assert_eq!(a.alloc(Some(20000)).unwrap_err(), PortError::OutOfRange(20000));
    }

    #[test]
    fn released_port_is_unavailable_until_cooldown() {
        let mut a = PortAllocator::new(10000, 10000);
        assert_eq!(a.alloc(None).unwrap(), 10000);
        a.release(10000);
        // Still cooling.
        assert_eq!(a.alloc(None).unwrap_err(), PortError::Exhausted);
        a.promote_all_for_test();
        assert_eq!(a.alloc(None).unwrap(), 10000);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut a = PortAllocator::new(10000, 10001);
        let p = a.alloc(None).unwrap();
        a.release(p);
        a.release(p);
        a.promote_all_for_test();
        assert_eq!(a.free_count(), 2);
    }
}
