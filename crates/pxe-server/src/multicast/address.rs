//! Multicast group allocation from the administratively scoped pool.

use crate::error::PxeError;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// First address of the pool.
pub const POOL_START: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);
/// Last address of the pool.
pub const POOL_END: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 254);

/// Lowest pool address not in `in_use`.
pub fn allocate_address(in_use: impl IntoIterator<Item = Ipv4Addr>) -> Result<Ipv4Addr, PxeError> {
    let in_use: HashSet<Ipv4Addr> = in_use.into_iter().collect();
    (u32::from(POOL_START)..=u32::from(POOL_END))
        .map(Ipv4Addr::from)
        .find(|addr| !in_use.contains(addr))
        .ok_or(PxeError::AddressPoolExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(239, 255, 0, last)
    }

    #[test]
    fn test_first_address() {
        assert_eq!(allocate_address([]).unwrap(), pool(1));
    }

    #[test]
    fn test_fills_lowest_gap() {
        assert_eq!(allocate_address([pool(1), pool(3)]).unwrap(), pool(2));
    }

    #[test]
    fn test_exhausted() {
        let all = (1..=254).map(pool);
        assert!(matches!(allocate_address(all), Err(PxeError::AddressPoolExhausted)));
    }

    #[test]
    fn test_outside_addresses_ignored() {
        let taken = [Ipv4Addr::new(239, 1, 1, 1), Ipv4Addr::new(10, 0, 0, 1)];
        assert_eq!(allocate_address(taken).unwrap(), pool(1));
    }
}
