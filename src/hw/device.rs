//! Network device collaborator and link-layer address cache

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Link-layer address of the interface backing a ring
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum L2Address {
    Ethernet([u8; 6]),
    Infiniband([u8; 20]),
}

impl L2Address {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Ethernet(mac) => mac,
            Self::Infiniband(gid) => gid,
        }
    }
}

impl fmt::Display for L2Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for byte in self.as_bytes() {
            if !first {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
            first = false;
        }
        Ok(())
    }
}

/// Device state the ring reads but never owns
pub trait NetDevice: Send + Sync {
    fn is_up(&self) -> bool;

    fn mtu(&self) -> u32;

    fn l2_address(&self) -> L2Address;

    /// Convert a raw hardware clock value to wall-clock time
    fn convert_hw_time(&self, hw_ticks: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_nanos(hw_ticks)
    }
}

/// Single-writer cache of the current link-layer address
///
/// `replace` swaps in the new value and drops the previous one before
/// returning, so at most one address is alive at a time.
#[derive(Debug, Default)]
pub struct L2AddressCache {
    current: Mutex<Option<L2Address>>,
}

impl L2AddressCache {
    pub fn new(initial: Option<L2Address>) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// Install `address`, disposing of the previous one
    pub fn replace(&self, address: L2Address) {
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            current.replace(address)
        };
        drop(previous);
    }

    pub fn clear(&self) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = None;
    }

    pub fn get(&self) -> Option<L2Address> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_cache_replace() {
        let cache = L2AddressCache::new(None);
        assert!(cache.get().is_none());

        cache.replace(L2Address::Ethernet([0, 1, 2, 3, 4, 5]));
        cache.replace(L2Address::Ethernet([6, 7, 8, 9, 10, 11]));
        assert_eq!(cache.get(), Some(L2Address::Ethernet([6, 7, 8, 9, 10, 11])));

        cache.clear();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_l2_display() {
        let addr = L2Address::Ethernet([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(addr.to_string(), "de:ad:be:ef:00:01");
    }
}
