use std::net::Ipv6Addr;

use super::*;

#[test]
fn test_peer_address_round_trip_v4() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let a = PeerAddress {
        ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        port: 1001,
    };
    a.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut addr_decoded = PeerAddress::default();
    addr_decoded.get_from(&decoded)?;
    assert_eq!(addr_decoded, a, "should be equal");

    Ok(())
}

#[test]
fn test_peer_address_round_trip_v6() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let a = PeerAddress {
        ip: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x0001)),
        port: 40001,
    };
    a.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut addr_decoded = PeerAddress::default();
    addr_decoded.get_from(&decoded)?;
    assert_eq!(addr_decoded, a, "should be equal");

    Ok(())
}

#[test]
fn test_peer_address_from_socket_addr() {
    let s: SocketAddr = "10.0.0.5:7777".parse().unwrap();
    let a = PeerAddress::from(s);
    assert_eq!(a.ip, s.ip(), "should be equal");
    assert_eq!(a.port, s.port(), "should be equal");
    assert_eq!(a.to_string(), "10.0.0.5:7777", "unexpected stringer output");
}
