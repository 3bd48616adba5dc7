pub mod chandata;
pub mod channum;
pub mod data;
pub mod dontfrag;
pub mod evenport;
pub mod lifetime;
pub mod peeraddr;
pub mod relayaddr;
pub mod reqtrans;
pub mod rsrvtoken;

use std::fmt;

/// `Protocol` is an IANA-assigned protocol number, as carried by the
/// REQUESTED-TRANSPORT attribute.
#[derive(PartialEq, Eq, Default, Copy, Clone, Debug, Hash)]
pub struct Protocol(pub u8);

/// TCP protocol number.
pub const PROTO_TCP: Protocol = Protocol(6);
/// UDP protocol number.
pub const PROTO_UDP: Protocol = Protocol(17);

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("{}", self.0);
        let s = match *self {
            PROTO_UDP => "UDP",
            PROTO_TCP => "TCP",
            _ => others.as_str(),
        };

        write!(f, "{s}")
    }
}
