//! BACnet Transport Interface
//!
//! The transaction engine sits on top of the network layer and only needs a
//! way to hand an APDU to it. Receiving runs the other way: whoever owns the
//! socket passes datagrams to
//! [`on_transport_pdu`](crate::StateMachineAccessPoint::on_transport_pdu).

use crate::app::Apdu;
use crate::network::Address;

/// Downward interface to the network layer
pub trait Transport {
    /// Queue `apdu` for delivery to `destination`. Delivery is best effort;
    /// the state machines recover lost PDUs through their own timers.
    fn send(&mut self, apdu: &Apdu, destination: &Address);
}

/// Transport that encodes APDUs and collects the datagrams
///
/// Useful for hosts that drain outgoing traffic in batches, and for wiring
/// two access points back to back.
#[derive(Debug, Default)]
pub struct BufferedTransport {
    outgoing: Vec<(Vec<u8>, Address)>,
}

impl BufferedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every datagram queued so far
    pub fn drain(&mut self) -> Vec<(Vec<u8>, Address)> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }
}

impl Transport for BufferedTransport {
    fn send(&mut self, apdu: &Apdu, destination: &Address) {
        self.outgoing.push((apdu.encode(), destination.clone()));
    }
}
