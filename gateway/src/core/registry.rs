//! Per-source-address admission control
//!
//! [`ConnectionRegistry`] counts live chat connections per client IP behind a
//! single mutex. Admission hands out a [`ConnectionSlot`]; dropping the slot
//! is the only way to give the capacity back, so the count is decremented
//! exactly once on every exit path, including unwinding.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Admission rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionLimitError {
    #[error("{ip} already holds {limit} connections")]
    PerIpLimitReached { ip: IpAddr, limit: u32 },
}

/// Live connection counts keyed by client IP
#[derive(Debug)]
pub struct ConnectionRegistry {
    max_per_ip: u32,
    counts: Mutex<HashMap<IpAddr, u32>>,
}

impl ConnectionRegistry {
    pub fn new(max_per_ip: u32) -> Arc<Self> {
        Arc::new(Self {
            max_per_ip,
            counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn max_per_ip(&self) -> u32 {
        self.max_per_ip
    }

    /// Reserve one connection for `ip`, or reject without touching the count.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionSlot, ConnectionLimitError> {
        let mut counts = self.counts.lock();
        let current = counts.get(&ip).copied().unwrap_or(0);
        if current >= self.max_per_ip {
            return Err(ConnectionLimitError::PerIpLimitReached {
                ip,
                limit: self.max_per_ip,
            });
        }
        counts.insert(ip, current + 1);

        Ok(ConnectionSlot {
            registry: Arc::clone(self),
            ip,
        })
    }

    /// Live connections held by `ip`
    pub fn count(&self, ip: &IpAddr) -> u32 {
        self.counts.lock().get(ip).copied().unwrap_or(0)
    }

    /// Live connections across every address
    pub fn total(&self) -> u32 {
        self.counts.lock().values().sum()
    }

    /// Number of addresses currently holding at least one connection
    pub fn tracked_addresses(&self) -> usize {
        self.counts.lock().len()
    }

    fn release(&self, ip: IpAddr) {
        let mut counts = self.counts.lock();
        let remaining = match counts.get_mut(&ip) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                tracing::error!(ip = %ip, "Released a connection slot that was not tracked");
                return;
            }
        };
        if remaining == 0 {
            counts.remove(&ip);
        }
    }
}

/// One admitted connection. Capacity is returned when this is dropped.
#[derive(Debug)]
pub struct ConnectionSlot {
    registry: Arc<ConnectionRegistry>,
    ip: IpAddr,
}

impl ConnectionSlot {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.release(self.ip);
        tracing::debug!(ip = %self.ip, "Connection slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_acquire_until_limit() {
        let registry = ConnectionRegistry::new(3);
        let a = ip(100);

        let slots: Vec<_> = (0..3).map(|_| registry.try_acquire(a).unwrap()).collect();
        assert_eq!(registry.count(&a), 3);

        assert_eq!(
            registry.try_acquire(a).unwrap_err(),
            ConnectionLimitError::PerIpLimitReached { ip: a, limit: 3 }
        );
        // A rejected attempt never shows up in the count
        assert_eq!(registry.count(&a), 3);

        drop(slots);
        assert_eq!(registry.count(&a), 0);
        assert_eq!(registry.tracked_addresses(), 0);
    }

    #[test]
    fn test_limits_are_per_address() {
        let registry = ConnectionRegistry::new(1);
        let _first = registry.try_acquire(ip(1)).unwrap();
        let _second = registry.try_acquire(ip(2)).unwrap();

        assert!(registry.try_acquire(ip(1)).is_err());
        assert_eq!(registry.total(), 2);
    }

    #[test]
    fn test_eleventh_connection_rejected() {
        let registry = ConnectionRegistry::new(10);
        let a = ip(11);
        let _slots: Vec<_> = (0..10).map(|_| registry.try_acquire(a).unwrap()).collect();

        assert!(registry.try_acquire(a).is_err());
        assert_eq!(registry.count(&a), 10);
    }

    #[test]
    fn test_release_after_panic() {
        let registry = ConnectionRegistry::new(2);
        let a = ip(5);

        let cloned = Arc::clone(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _slot = cloned.try_acquire(a).unwrap();
            panic!("session blew up");
        }));

        assert!(result.is_err());
        assert_eq!(registry.count(&a), 0);
    }

    #[tokio::test]
    async fn test_concurrent_release_is_exactly_once() {
        let registry = ConnectionRegistry::new(10);
        let a = ip(9);
        let _other = registry.try_acquire(a).unwrap();
        let holder = Arc::new(Mutex::new(Some(registry.try_acquire(a).unwrap())));
        assert_eq!(registry.count(&a), 2);

        // Two shutdown paths race to release the same slot
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let holder = Arc::clone(&holder);
                tokio::spawn(async move {
                    let slot = holder.lock().take();
                    drop(slot);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.count(&a), 1);
    }
}
