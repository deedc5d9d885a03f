//! Tests for primitive encoding/decoding: integers, bool, fixed arrays,
//! length-prefixed byte vectors, and the safety limits guarding decode.

use crate::encoding::*;

#[test]
fn roundtrip_u8() {
    let val: u8 = 0xAB;
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes, [0xAB]);
    let (decoded, consumed) = decode_from_slice::<u8>(&bytes).unwrap();
    assert_eq!(decoded, val);
    assert_eq!(consumed, 1);
}

#[test]
fn roundtrip_u16_big_endian() {
    let val: u16 = 0x1234;
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes, [0x12, 0x34]);
    let (decoded, consumed) = decode_from_slice::<u16>(&bytes).unwrap();
    assert_eq!(decoded, val);
    assert_eq!(consumed, 2);
}

#[test]
fn roundtrip_u32_big_endian() {
    let val: u32 = 0xDEAD_BEEF;
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes, [0xDE, 0xAD, 0xBE, 0xEF]);
    let (decoded, _) = decode_from_slice::<u32>(&bytes).unwrap();
    assert_eq!(decoded, val);
}

#[test]
fn roundtrip_u64_big_endian() {
    let val: u64 = 0x0102_0304_0506_0708;
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    let (decoded, _) = decode_from_slice::<u64>(&bytes).unwrap();
    assert_eq!(decoded, val);
}

#[test]
fn roundtrip_bool() {
    for val in [true, false] {
        let bytes = encode_to_vec(&val).unwrap();
        let (decoded, consumed) = decode_from_slice::<bool>(&bytes).unwrap();
        assert_eq!(decoded, val);
        assert_eq!(consumed, 1);
    }
}

#[test]
fn invalid_bool_byte_is_rejected() {
    let err = bool::decode_from(&[0x02]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(0x02)));
}

#[test]
fn roundtrip_fixed_array() {
    let val: [u8; 8] = *b"SEGMTSST";
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes.as_slice(), b"SEGMTSST");
    let (decoded, consumed) = decode_from_slice::<[u8; 8]>(&bytes).unwrap();
    assert_eq!(&decoded, b"SEGMTSST");
    assert_eq!(consumed, 8);
}

#[test]
fn roundtrip_length_prefixed_bytes() {
    let val = b"hello world".to_vec();
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(&bytes[..4], &[0, 0, 0, 11]);
    let (decoded, consumed) = decode_from_slice::<Vec<u8>>(&bytes).unwrap();
    assert_eq!(decoded, val);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn raw_bytes_have_no_length_prefix() {
    let (data, consumed) = read_raw_bytes(b"abcdef", 3).unwrap();
    assert_eq!(data, b"abc");
    assert_eq!(consumed, 3);
}

#[test]
fn decode_reports_unexpected_eof() {
    let err = u32::decode_from(&[0x00, 0x01]).unwrap_err();
    match err {
        EncodingError::UnexpectedEof { needed, available } => {
            assert_eq!(needed, 4);
            assert_eq!(available, 2);
        }
        other => panic!("expected UnexpectedEof, got {other:?}"),
    }
}

#[test]
fn byte_vector_length_over_limit_is_rejected() {
    let mut buf = Vec::new();
    (MAX_BYTE_LEN + 1).encode_to(&mut buf).unwrap();
    let err = Vec::<u8>::decode_from(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}
