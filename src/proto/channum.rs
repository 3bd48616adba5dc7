#[cfg(test)]
mod channum_test;

use std::fmt;

use stun::attributes::*;
use stun::checks::*;
use stun::message::*;

// Channel numbers:
//   0x4000 through 0x7FFF: the allowed channel numbers
//   (16,383 possible values).
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
pub const MAX_CHANNEL_NUMBER: u16 = 0x7fff;

const CHANNEL_NUMBER_SIZE: usize = 4;

/// Returns `true` if `n` lies in the valid channel number range.
pub fn is_channel_number(n: u16) -> bool {
    (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&n)
}

/// `ChannelNumber` represents the CHANNEL-NUMBER attribute.
///
/// The CHANNEL-NUMBER attribute contains the number of the channel.
///
/// RFC 5766 Section 14.1
#[derive(Default, Eq, PartialEq, Debug, Copy, Clone, Hash)]
pub struct ChannelNumber(pub u16);

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHANNEL-NUMBER: {}", self.0)
    }
}

impl Setter for ChannelNumber {
    // Adds CHANNEL-NUMBER to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; CHANNEL_NUMBER_SIZE];
        v[..2].copy_from_slice(&self.0.to_be_bytes());
        // v[2..4] are zeroes (RFFU = Reserved For Future Use)
        m.add(ATTR_CHANNEL_NUMBER, &v);
        Ok(())
    }
}

impl Getter for ChannelNumber {
    // Decodes CHANNEL-NUMBER from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_CHANNEL_NUMBER)?;

        check_size(ATTR_CHANNEL_NUMBER, v.len(), CHANNEL_NUMBER_SIZE)?;

        self.0 = u16::from_be_bytes([v[0], v[1]]);
        Ok(())
    }
}
