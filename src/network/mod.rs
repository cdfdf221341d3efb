//! BACnet Network Addressing
//!
//! The transaction engine does not route, but it has to key server transactions
//! by the address of the requesting peer and must tell station addresses from
//! broadcasts. [`Address`] covers the address forms a network layer hands up.

use std::fmt;
use std::net::SocketAddr;

/// Source or destination of an APDU
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// A station on the directly attached network
    LocalStation(Vec<u8>),
    /// A station on another network, reached through a router
    RemoteStation { network: u16, mac: Vec<u8> },
    /// Every station on the directly attached network
    LocalBroadcast,
    /// Every station on the given remote network
    RemoteBroadcast(u16),
    /// Every station on every network
    GlobalBroadcast,
}

impl Address {
    /// Create a remote station address
    pub fn remote(network: u16, mac: Vec<u8>) -> Self {
        Address::RemoteStation { network, mac }
    }

    /// Check if this addresses exactly one device
    pub fn is_station(&self) -> bool {
        matches!(
            self,
            Address::LocalStation(_) | Address::RemoteStation { .. }
        )
    }

    /// Check if this is any kind of broadcast address
    pub fn is_broadcast(&self) -> bool {
        !self.is_station()
    }

    /// Check if this is a local network address
    pub fn is_local(&self) -> bool {
        matches!(self, Address::LocalStation(_) | Address::LocalBroadcast)
    }

    /// Network number, `None` for local addresses and global broadcast
    pub fn network(&self) -> Option<u16> {
        match self {
            Address::RemoteStation { network, .. } | Address::RemoteBroadcast(network) => {
                Some(*network)
            }
            _ => None,
        }
    }
}

/// BACnet/IP style MAC: four address octets followed by the port
impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        let mut mac = match addr {
            SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
            SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
        };
        mac.extend_from_slice(&addr.port().to_be_bytes());
        Address::LocalStation(mac)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::LocalStation(mac) => write!(f, "{}", hex::encode(mac)),
            Address::RemoteStation { network, mac } => {
                write!(f, "{}:{}", network, hex::encode(mac))
            }
            Address::LocalBroadcast => write!(f, "*"),
            Address::RemoteBroadcast(network) => write!(f, "{}:*", network),
            Address::GlobalBroadcast => write!(f, "*:*"),
        }
    }
}
