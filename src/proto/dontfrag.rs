#[cfg(test)]
mod dontfrag_test;

use stun::attributes::*;
use stun::message::*;

/// `DontFragmentAttr` represents the DONT-FRAGMENT attribute.
///
/// The client uses this attribute to ask the server to set the DF bit on
/// IPv4 datagrams relayed to the peer. It carries no value.
///
/// RFC 5766 Section 14.8
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct DontFragmentAttr;

impl Setter for DontFragmentAttr {
    // Adds DONT-FRAGMENT to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_DONT_FRAGMENT, &[]);
        Ok(())
    }
}

impl Getter for DontFragmentAttr {
    // Reports presence of DONT-FRAGMENT in the message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let _ = m.get(ATTR_DONT_FRAGMENT)?;
        Ok(())
    }
}

impl DontFragmentAttr {
    /// Returns `true` if the attribute is present in `m`.
    pub fn is_set(&self, m: &Message) -> bool {
        m.get(ATTR_DONT_FRAGMENT).is_ok()
    }
}
