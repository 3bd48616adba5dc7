use super::*;

#[test]
fn test_reservation_token_add_to() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let tok = ReservationToken(vec![1, 2, 3, 4, 5, 6, 7, 8]);
    tok.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut tok_decoded = ReservationToken::default();
    tok_decoded.get_from(&decoded)?;
    assert_eq!(tok_decoded, tok, "should be equal");

    Ok(())
}

#[test]
fn test_reservation_token_bad_length() {
    let tok = ReservationToken(vec![1, 2, 3]);
    let mut m = Message::new();
    if let Err(err) = tok.add_to(&mut m) {
        assert_eq!(
            stun::Error::ErrAttributeSizeInvalid,
            err,
            "should be invalid attribute size"
        );
    } else {
        panic!("expected error");
    }
}
