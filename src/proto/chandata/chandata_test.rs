use super::*;

#[test]
fn test_channel_data_encode() -> Result<()> {
    let mut ch_data = ChannelData {
        data: vec![1, 2, 3, 4],
        number: ChannelNumber(MIN_CHANNEL_NUMBER + 1),
        ..Default::default()
    };
    ch_data.encode();

    let mut b = ChannelData {
        raw: ch_data.raw.clone(),
        ..Default::default()
    };
    b.decode()?;

    assert_eq!(b.number, ch_data.number, "should be equal");
    assert_eq!(b.data, ch_data.data, "should be equal");
    assert!(
        ChannelData::is_channel_data(&ch_data.raw),
        "unexpected IsChannelData"
    );

    Ok(())
}

#[test]
fn test_channel_data_padding() -> Result<()> {
    // 3 bytes of data encode into a frame padded to the next 4-byte
    // boundary; the length field counts only the data.
    let mut ch_data = ChannelData {
        data: vec![1, 2, 3],
        number: ChannelNumber(MIN_CHANNEL_NUMBER),
        ..Default::default()
    };
    ch_data.encode();

    assert_eq!(ch_data.raw.len(), 8, "frame should be padded to 8 bytes");
    assert_eq!(
        u16::from_be_bytes([ch_data.raw[2], ch_data.raw[3]]),
        3,
        "length field should exclude padding"
    );

    // Decoders accept the unpadded form too.
    let mut unpadded = ChannelData {
        raw: ch_data.raw[..7].to_vec(),
        ..Default::default()
    };
    unpadded.decode()?;
    assert_eq!(unpadded.data, vec![1, 2, 3], "should be equal");

    Ok(())
}

#[test]
fn test_channel_data_decode_errors() {
    let tests = vec![
        ("short frame", vec![1, 2, 3], Error::ErrUnexpectedEof),
        (
            "invalid channel number",
            vec![0x3f, 0xff, 0x00, 0x00],
            Error::ErrInvalidChannelNumber,
        ),
        (
            "length past buffer",
            vec![0x40, 0x00, 0x00, 0x05, 1, 2, 3, 4],
            Error::ErrBadChannelDataLength,
        ),
    ];

    for (name, raw, want) in tests {
        let mut ch_data = ChannelData {
            raw,
            ..Default::default()
        };
        if let Err(err) = ch_data.decode() {
            assert_eq!(want, err, "unexpected error for {name}");
        } else {
            panic!("expected error for {name}");
        }
    }
}

#[test]
fn test_channel_data_reset() -> Result<()> {
    let mut ch_data = ChannelData {
        data: vec![1, 2, 3, 4],
        number: ChannelNumber(MIN_CHANNEL_NUMBER + 1),
        ..Default::default()
    };
    ch_data.encode();

    let mut buf = vec![0; ch_data.raw.len()];
    buf.copy_from_slice(&ch_data.raw);
    ch_data.reset();
    ch_data.raw = buf;
    ch_data.decode()?;

    assert_eq!(
        ch_data.number,
        ChannelNumber(MIN_CHANNEL_NUMBER + 1),
        "should be equal"
    );
    assert_eq!(ch_data.data, vec![1, 2, 3, 4], "should be equal");

    Ok(())
}

#[test]
fn test_is_channel_data() {
    let tests = vec![
        ("empty", vec![], false),
        ("short", vec![1, 2, 3], false),
        ("stun-like first bits", vec![0x00, 0x01, 0x00, 0x00], false),
        ("zero length", vec![0x40, 0x00, 0x00, 0x00], true),
        ("length mismatch", vec![0x40, 0x00, 0x00, 0x05, 1, 2], false),
        (
            "valid frame",
            vec![0x7f, 0xff, 0x00, 0x02, 0xab, 0xcd],
            true,
        ),
    ];

    for (name, buf, want) in tests {
        assert_eq!(
            ChannelData::is_channel_data(&buf),
            want,
            "unexpected result for {name}"
        );
    }
}
