//! CIDR network parsing for trusted-proxy matching
//!
//! Only the subset needed for proxy allow-lists is supported: an address with
//! an optional `/prefix` suffix. A bare address is treated as a host network
//! (`/32` for IPv4, `/128` for IPv6).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while parsing a CIDR network
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpNetworkError {
    #[error("Invalid IP address in network '{0}'")]
    InvalidAddress(String),

    #[error("Invalid prefix length in network '{0}'")]
    InvalidPrefix(String),
}

/// An IPv4 or IPv6 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Returns true when `ip` falls inside this network.
    ///
    /// IPv4-mapped IPv6 addresses are compared against IPv4 networks so that
    /// dual-stack listeners still match proxies configured as IPv4 ranges.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };

        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(candidate)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(candidate) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(candidate)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(candidate) & mask
            }
            _ => false,
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for IpNetwork {
    type Err = IpNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| IpNetworkError::InvalidAddress(s.to_string()))?;

        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max_prefix)
                .ok_or_else(|| IpNetworkError::InvalidPrefix(s.to_string()))?,
            None => max_prefix,
        };

        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Parse a comma-separated list of CIDR networks, skipping blank entries.
pub fn parse_network_list(value: &str) -> Result<Vec<IpNetwork>, IpNetworkError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(IpNetwork::from_str)
        .collect()
}
