use super::*;

#[test]
fn test_dont_fragment() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let d = DontFragmentAttr;

    assert!(!d.is_set(&m), "should not be set on a blank message");

    d.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;
    assert!(d.is_set(&decoded), "should be set after add_to");

    Ok(())
}
