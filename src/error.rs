use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("turn: neither a transport conn nor a STUN transactor was provided")]
    ErrNoTransport,
    #[error("turn: all retransmissions failed, transaction timed out")]
    ErrTimeout,
    #[error("turn: transaction canceled")]
    ErrCanceled,
    #[error("turn: server returned error {code}: {reason}")]
    ErrServer { code: u16, reason: String },
    #[error("turn: required attribute missing or malformed in response")]
    ErrMalformedResponse,
    #[error("turn: MESSAGE-INTEGRITY mismatch")]
    ErrIntegrityFailed,
    #[error("turn: channel number not in [0x4000, 0x7FFF]")]
    ErrInvalidChannelNumber,
    #[error("turn: channelData length != len(data)")]
    ErrBadChannelDataLength,
    #[error("turn: unexpected EOF")]
    ErrUnexpectedEof,
    #[error("turn: channel already bound for this peer")]
    ErrAlreadyBound,
    #[error("turn: channel number space exhausted")]
    ErrNoChannelsFree,
    #[error("turn: peer must be reachable over UDP")]
    ErrUnsupportedPeerType,
    #[error("turn: allocation is dead")]
    ErrAllocationDead,
    #[error("turn: transport connection lost")]
    ErrConnectionLost,
    #[error("turn: use of closed conduit")]
    ErrClosed,
    #[error("turn: only one Allocate() caller is allowed")]
    ErrOneAllocateOnly,
    #[error("turn: a permission for this peer already exists")]
    ErrPermissionExists,
    #[error("turn: try again")]
    ErrTryAgain,
    #[error("turn: unexpected response type")]
    ErrUnexpectedResponse,
    #[error("turn: too short buffer")]
    ErrShortBuffer,
    #[error("turn: transaction closed")]
    ErrTransactionClosed,
    #[error("turn: wait_for_result called on non-result transaction")]
    ErrWaitForResultOnNonResultTransaction,
    #[error("turn: unexpected STUN request message")]
    ErrUnexpectedStunRequest,
    #[error("turn: no binding found for channel")]
    ErrChannelBindNotFound,
    #[error("turn: STUN server address is not set for the client")]
    ErrStunServerAddressNotSet,
    #[error("turn: TURN server address is not set for the client")]
    ErrTurnServerAddressNotSet,
    #[error("turn: fake error")]
    ErrFakeErr,
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
