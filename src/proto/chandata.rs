#[cfg(test)]
mod chandata_test;

use super::channum::*;
use crate::error::*;

const PADDING: usize = 4;
const CHANNEL_DATA_NUMBER_SIZE: usize = 2;
const CHANNEL_DATA_LENGTH_SIZE: usize = 2;
const CHANNEL_DATA_HEADER_SIZE: usize = CHANNEL_DATA_NUMBER_SIZE + CHANNEL_DATA_LENGTH_SIZE;

/// `ChannelData` represents the ChannelData Message defined in RFC 5766.
///
/// The ChannelData message is used to carry application data between the
/// client and the server. It has the following format:
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// /                       Application Data                        /
/// /                                                               /
/// |                               |
/// +-------------------------------+
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub data: Vec<u8>,
    pub number: ChannelNumber,
    pub raw: Vec<u8>,
}

impl ChannelData {
    /// Resets the `ChannelData` to a freshly-constructed state, retaining
    /// the allocated buffers.
    pub fn reset(&mut self) {
        self.raw.clear();
        self.data.clear();
        self.number = ChannelNumber::default();
    }

    /// Encodes the channel number, length and data into `raw`, padding the
    /// frame to a 4-byte boundary as required on stream transports. The
    /// length field never includes the padding.
    pub fn encode(&mut self) {
        self.raw.clear();
        self.raw
            .extend_from_slice(&self.number.0.to_be_bytes());
        self.raw
            .extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        self.raw.extend_from_slice(&self.data);

        let padded = nearest_padded_value_length(self.raw.len());
        let bytes_to_add = padded - self.raw.len();
        if bytes_to_add > 0 {
            self.raw.extend_from_slice(&vec![0; bytes_to_add]);
        }
    }

    /// Decodes `raw` into the channel number and data slice. Both padded
    /// and unpadded frames are accepted.
    pub fn decode(&mut self) -> Result<()> {
        if self.raw.len() < CHANNEL_DATA_HEADER_SIZE {
            return Err(Error::ErrUnexpectedEof);
        }

        let number = u16::from_be_bytes([self.raw[0], self.raw[1]]);
        if !is_channel_number(number) {
            return Err(Error::ErrInvalidChannelNumber);
        }
        self.number = ChannelNumber(number);

        let l = u16::from_be_bytes([self.raw[2], self.raw[3]]) as usize;
        if l > self.raw.len() - CHANNEL_DATA_HEADER_SIZE {
            return Err(Error::ErrBadChannelDataLength);
        }
        self.data = self.raw[CHANNEL_DATA_HEADER_SIZE..CHANNEL_DATA_HEADER_SIZE + l].to_vec();

        Ok(())
    }

    /// Returns `true` if `buf` looks like a ChannelData frame: the leading
    /// two bits are `01` (a valid channel number) and the length field is
    /// consistent with the buffer.
    pub fn is_channel_data(buf: &[u8]) -> bool {
        if buf.len() < CHANNEL_DATA_HEADER_SIZE {
            return false;
        }

        let l = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if l > buf.len() - CHANNEL_DATA_HEADER_SIZE {
            return false;
        }

        is_channel_number(u16::from_be_bytes([buf[0], buf[1]]))
    }
}

fn nearest_padded_value_length(l: usize) -> usize {
    let mut n = PADDING * (l / PADDING);
    if n < l {
        n += PADDING;
    }
    n
}
