//! Address normalization
//!
//! Turns the textual editor address of a feed record into an [`Ordinal`]
//! that can be compared against range bounds. IPv4-mapped IPv6 addresses
//! collapse to their IPv4 ordinal so a range authored in either notation
//! matches both.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4 (32-bit)
    V4,
    /// IPv6 (128-bit)
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Totally ordered position of an address within its family
///
/// IPv4 addresses occupy the low 32 bits of `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ordinal {
    /// Address family
    pub family: AddressFamily,
    /// Numeric value of the address
    pub value: u128,
}

impl Ordinal {
    /// Ordinal of an IPv4 address
    pub fn v4(addr: Ipv4Addr) -> Self {
        Self {
            family: AddressFamily::V4,
            value: u128::from(u32::from(addr)),
        }
    }

    /// Ordinal of an IPv6 address, collapsing the IPv4-mapped form
    pub fn v6(addr: Ipv6Addr) -> Self {
        match addr.to_ipv4_mapped() {
            Some(v4) => Self::v4(v4),
            None => Self {
                family: AddressFamily::V6,
                value: u128::from(addr),
            },
        }
    }

    /// Address this ordinal stands for
    pub fn to_ip(self) -> IpAddr {
        match self.family {
            // V4 ordinals are only built from 32-bit values
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::from(self.value as u32)),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::from(self.value)),
        }
    }
}

impl From<IpAddr> for Ordinal {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::v4(v4),
            IpAddr::V6(v6) => Self::v6(v6),
        }
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip())
    }
}

/// Normalize textual address to an [`Ordinal`]
///
/// Accepts surrounding whitespace, `[brackets]` and an IPv6 zone suffix
/// (`fe80::1%eth0`). IPv4 octets may carry leading zeros and are always read
/// as decimal.
pub fn normalize(text: &str) -> Result<Ordinal> {
    let trimmed = text.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let bare = match unbracketed.split_once('%') {
        Some((addr, _zone)) => addr,
        None => unbracketed,
    };

    if bare.is_empty() {
        return Err(Error::invalid_address(format!("{:?}", text)));
    }

    if bare.contains(':') {
        return parse_ipv6(bare)
            .map(Ordinal::v6)
            .ok_or_else(|| Error::invalid_address(format!("{:?}", text)));
    }

    parse_dotted_quad(bare)
        .map(Ordinal::v4)
        .ok_or_else(|| Error::invalid_address(format!("{:?}", text)))
}

// std rejects leading zeros in an embedded IPv4 tail, so rewrite it first
fn parse_ipv6(text: &str) -> Option<Ipv6Addr> {
    match text.rsplit_once(':') {
        Some((head, tail)) if tail.contains('.') => {
            let v4 = parse_dotted_quad(tail)?;
            format!("{}:{}", head, v4).parse().ok()
        }
        _ => text.parse().ok(),
    }
}

fn parse_dotted_quad(text: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = text.split('.');

    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = part.trim_start_matches('0');
        *octet = if digits.is_empty() {
            0
        } else {
            digits.parse::<u8>().ok()?
        };
    }

    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}
