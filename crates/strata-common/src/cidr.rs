//! IPv4 CIDR blocks
//!
//! Just enough address arithmetic to validate a network CIDR and carve it into
//! equally-sized sub-blocks.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// An IPv4 network in CIDR notation, normalized to its network address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Create a block, rejecting host bits set below the prefix
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, Error> {
        if prefix > 32 {
            return Err(Error::configuration(format!(
                "prefix length /{} is out of range",
                prefix
            )));
        }
        let network = u32::from(addr);
        if network & !mask(prefix) != 0 {
            return Err(Error::configuration(format!(
                "{}/{} has host bits set",
                addr, prefix
            )));
        }
        Ok(Self { network, prefix })
    }

    /// First address of the block
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix as u32)
    }

    /// Last address of the block
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network | !mask(self.prefix))
    }

    /// Whether `other` lies entirely inside this block
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.network & mask(self.prefix) == self.network
    }

    /// Whether the two blocks share any address
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The `index`-th sub-block of length `new_prefix`
    pub fn subnet(&self, new_prefix: u8, index: u32) -> Result<Ipv4Cidr, Error> {
        if new_prefix < self.prefix || new_prefix > 32 {
            return Err(Error::configuration(format!(
                "cannot split /{} into /{} blocks",
                self.prefix, new_prefix
            )));
        }
        let bits = (new_prefix - self.prefix) as u32;
        if bits < 32 && index as u64 >= (1u64 << bits) {
            return Err(Error::configuration(format!(
                "{} has no /{} block #{}",
                self, new_prefix, index
            )));
        }
        let step = 1u64 << (32 - new_prefix as u32);
        let network = self.network as u64 + index as u64 * step;
        Ok(Ipv4Cidr {
            network: network as u32,
            prefix: new_prefix,
        })
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::configuration(format!("'{}' is not in CIDR notation", s)))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| Error::configuration(format!("'{}' is not an IPv4 address", addr)))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| Error::configuration(format!("'{}' is not a prefix length", prefix)))?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
