#[cfg(test)]
mod reqtrans_test;

use std::fmt;

use stun::attributes::*;
use stun::checks::*;
use stun::message::*;

use super::*;

const REQUESTED_TRANSPORT_SIZE: usize = 4;

/// `RequestedTransport` represents the REQUESTED-TRANSPORT attribute.
///
/// It is used by the client to request a specific transport protocol for
/// the allocated transport address. Only UDP (17) is defined by RFC 5766.
///
/// RFC 5766 Section 14.7
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct RequestedTransport {
    pub protocol: Protocol,
}

impl fmt::Display for RequestedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "REQUESTED-TRANSPORT: {}", self.protocol)
    }
}

impl Setter for RequestedTransport {
    // Adds REQUESTED-TRANSPORT to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; REQUESTED_TRANSPORT_SIZE];
        v[0] = self.protocol.0;
        // v[1..4] are zeroes (RFFU = Reserved For Future Use)
        m.add(ATTR_REQUESTED_TRANSPORT, &v);
        Ok(())
    }
}

impl Getter for RequestedTransport {
    // Decodes REQUESTED-TRANSPORT from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_REQUESTED_TRANSPORT)?;

        check_size(ATTR_REQUESTED_TRANSPORT, v.len(), REQUESTED_TRANSPORT_SIZE)?;

        self.protocol = Protocol(v[0]);
        Ok(())
    }
}
