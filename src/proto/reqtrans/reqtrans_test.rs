use super::*;

#[test]
fn test_requested_transport_string() {
    let r = RequestedTransport {
        protocol: PROTO_UDP,
    };
    assert_eq!(
        r.to_string(),
        "REQUESTED-TRANSPORT: UDP",
        "unexpected stringer output"
    );
}

#[test]
fn test_requested_transport_add_to() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let r = RequestedTransport {
        protocol: PROTO_UDP,
    };
    r.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut req_decoded = RequestedTransport::default();
    req_decoded.get_from(&decoded)?;
    assert_eq!(req_decoded, r, "should be equal");

    // attribute not found
    let blank = Message::new();
    let mut handle = RequestedTransport::default();
    if let Err(err) = handle.get_from(&blank) {
        assert_eq!(stun::Error::ErrAttributeNotFound, err, "should be not found");
    } else {
        panic!("expected error");
    }

    Ok(())
}
