use super::*;

#[test]
fn test_relayed_address_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let a = RelayedAddress {
        ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        port: 1113,
    };
    a.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut addr_decoded = RelayedAddress::default();
    addr_decoded.get_from(&decoded)?;
    assert_eq!(addr_decoded, a, "should be equal");

    // attribute not found
    let blank = Message::new();
    let mut handle = RelayedAddress::default();
    assert!(handle.get_from(&blank).is_err(), "should fail");

    Ok(())
}
