#[cfg(test)]
mod evenport_test;

use std::fmt;

use stun::attributes::*;
use stun::checks::*;
use stun::message::*;

const EVEN_PORT_SIZE: usize = 1;
const FIRST_BIT_SET: u8 = 0x80;

/// `EvenPort` represents the EVEN-PORT attribute.
///
/// The client may ask the server to allocate an even-numbered port, and
/// optionally to reserve the next-higher port for a subsequent
/// allocation.
///
/// RFC 5766 Section 14.6
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct EvenPort {
    /// `reserve_port` means that the server is requested to reserve the
    /// next-higher port number for a subsequent allocation.
    pub reserve_port: bool,
}

impl fmt::Display for EvenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reserve_port {
            write!(f, "EVEN-PORT: <reserve>")
        } else {
            write!(f, "EVEN-PORT")
        }
    }
}

impl Setter for EvenPort {
    // Adds EVEN-PORT to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; EVEN_PORT_SIZE];
        if self.reserve_port {
            // Set the R bit.
            v[0] |= FIRST_BIT_SET;
        }
        m.add(ATTR_EVEN_PORT, &v);
        Ok(())
    }
}

impl Getter for EvenPort {
    // Decodes EVEN-PORT from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_EVEN_PORT)?;

        check_size(ATTR_EVEN_PORT, v.len(), EVEN_PORT_SIZE)?;

        self.reserve_port = v[0] & FIRST_BIT_SET != 0;
        Ok(())
    }
}
