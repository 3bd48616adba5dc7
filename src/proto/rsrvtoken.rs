#[cfg(test)]
mod rsrvtoken_test;

use stun::attributes::*;
use stun::checks::*;
use stun::message::*;

const RESERVATION_TOKEN_SIZE: usize = 8;

/// `ReservationToken` represents the RESERVATION-TOKEN attribute.
///
/// The attribute contains an 8-byte token that uniquely identifies a
/// relayed transport address being held in reserve by the server.
///
/// RFC 5766 Section 14.9
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct ReservationToken(pub Vec<u8>);

impl Setter for ReservationToken {
    // Adds RESERVATION-TOKEN to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        check_size(ATTR_RESERVATION_TOKEN, self.0.len(), RESERVATION_TOKEN_SIZE)?;
        m.add(ATTR_RESERVATION_TOKEN, &self.0);
        Ok(())
    }
}

impl Getter for ReservationToken {
    // Decodes RESERVATION-TOKEN from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_RESERVATION_TOKEN)?;
        check_size(ATTR_RESERVATION_TOKEN, v.len(), RESERVATION_TOKEN_SIZE)?;
        self.0 = v;
        Ok(())
    }
}
