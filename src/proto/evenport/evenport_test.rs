use super::*;

#[test]
fn test_even_port_add_to() -> Result<(), stun::Error> {
    for reserve_port in [false, true] {
        let mut m = Message::new();
        let p = EvenPort { reserve_port };
        p.add_to(&mut m)?;
        m.write_header();

        let mut decoded = Message::new();
        decoded.write(&m.raw)?;

        let mut port_decoded = EvenPort::default();
        port_decoded.get_from(&decoded)?;
        assert_eq!(port_decoded, p, "should be equal");
    }

    Ok(())
}

#[test]
fn test_even_port_string() {
    assert_eq!(
        EvenPort { reserve_port: true }.to_string(),
        "EVEN-PORT: <reserve>",
        "unexpected stringer output"
    );
    assert_eq!(
        EvenPort {
            reserve_port: false
        }
        .to_string(),
        "EVEN-PORT",
        "unexpected stringer output"
    );
}
