use super::*;

#[test]
fn test_channel_number_string() {
    let n = ChannelNumber(MIN_CHANNEL_NUMBER);
    assert_eq!(
        n.to_string(),
        "CHANNEL-NUMBER: 16384",
        "unexpected stringer output"
    );
}

#[test]
fn test_channel_number_add_to() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let n = ChannelNumber(MIN_CHANNEL_NUMBER + 7);
    n.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut num_decoded = ChannelNumber::default();
    num_decoded.get_from(&decoded)?;
    assert_eq!(num_decoded, n, "should be equal");

    // attribute not found
    let blank = Message::new();
    let mut handle = ChannelNumber::default();
    if let Err(err) = handle.get_from(&blank) {
        assert_eq!(stun::Error::ErrAttributeNotFound, err, "should be not found");
    } else {
        panic!("expected error");
    }

    Ok(())
}

#[test]
fn test_channel_number_bad_length() {
    let mut m = Message::new();
    m.add(ATTR_CHANNEL_NUMBER, &[1, 2, 3]);
    m.write_header();

    let mut handle = ChannelNumber::default();
    if let Err(err) = handle.get_from(&m) {
        assert_eq!(
            stun::Error::ErrAttributeSizeInvalid,
            err,
            "should be invalid attribute size"
        );
    } else {
        panic!("expected error");
    }
}

#[test]
fn test_is_channel_number() {
    assert!(!is_channel_number(0x3fff));
    assert!(is_channel_number(MIN_CHANNEL_NUMBER));
    assert!(is_channel_number(0x5abc));
    assert!(is_channel_number(MAX_CHANNEL_NUMBER));
    assert!(!is_channel_number(0x8000));
}
