//! Bind-address discovery
//!
//! When no host is given on the command line the server binds the first
//! private (RFC 1918) IPv4 address of a non-loopback interface, falling
//! back to whatever address is enumerated first.

use std::net::{IpAddr, Ipv4Addr};

use network_interface::{NetworkInterface, NetworkInterfaceConfig};

/// IPv4 addresses of all non-loopback interfaces, in enumeration order
pub fn list_addresses() -> Vec<Ipv4Addr> {
    let Ok(interfaces) = NetworkInterface::show() else {
        return Vec::new();
    };

    let mut addresses = Vec::new();
    for interface in interfaces {
        for addr in &interface.addr {
            if let IpAddr::V4(ip) = addr.ip() {
                if !ip.is_loopback() && !addresses.contains(&ip) {
                    addresses.push(ip);
                }
            }
        }
    }
    addresses
}

/// The address the server binds when none is specified
pub fn default_address() -> Option<Ipv4Addr> {
    select_default(&list_addresses())
}

fn select_default(addresses: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    addresses
        .iter()
        .copied()
        .find(|ip| ip.is_private())
        .or_else(|| addresses.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_private_address() {
        let addresses = vec![
            Ipv4Addr::new(203, 0, 113, 7),
            Ipv4Addr::new(192, 168, 1, 20),
            Ipv4Addr::new(10, 0, 0, 5),
        ];
        assert_eq!(
            select_default(&addresses),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn test_falls_back_to_first_address() {
        let addresses = vec![Ipv4Addr::new(203, 0, 113, 7), Ipv4Addr::new(198, 51, 100, 2)];
        assert_eq!(
            select_default(&addresses),
            Some(Ipv4Addr::new(203, 0, 113, 7))
        );
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(select_default(&[]), None);
    }

    #[test]
    fn test_all_private_ranges_match() {
        for ip in [
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 31, 255, 1),
            Ipv4Addr::new(192, 168, 0, 1),
        ] {
            assert_eq!(select_default(&[Ipv4Addr::new(8, 8, 8, 8), ip]), Some(ip));
        }
        // nearby public ranges must not be treated as private
        let addresses = vec![Ipv4Addr::new(11, 0, 0, 1), Ipv4Addr::new(172, 32, 0, 1)];
        assert_eq!(select_default(&addresses), Some(Ipv4Addr::new(11, 0, 0, 1)));
    }
}
