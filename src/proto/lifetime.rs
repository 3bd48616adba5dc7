
use std::fmt;

use stun::attributes::*;
use stun::checks::*;
use stun::message::*;
use tokio::time::Duration;

/// Default allocation lifetime (RFC 5766 Section 2.2) used when the
/// server does not state one.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

const LIFETIME_SIZE: usize = 4; // 4 bytes, 32 bits

/// `Lifetime` represents the LIFETIME attribute.
///
/// The LIFETIME attribute represents the duration for which the server
/// will maintain an allocation in the absence of a refresh, in seconds.
///
/// RFC 5766 Section 14.2
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Lifetime(pub Duration);

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LIFETIME: {} s", self.0.as_secs())
    }
}

impl Setter for Lifetime {
    // Adds LIFETIME to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let v = (self.0.as_secs() as u32).to_be_bytes();
        m.add(ATTR_LIFETIME, &v);
        Ok(())
    }
}

impl Getter for Lifetime {
    // Decodes LIFETIME from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_LIFETIME)?;

        check_size(ATTR_LIFETIME, v.len(), LIFETIME_SIZE)?;

        let seconds = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        self.0 = Duration::from_secs(seconds as u64);

        Ok(())
    }
}
