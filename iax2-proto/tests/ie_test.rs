use std::net::SocketAddr;

use iax2_proto::ies::{build_ies, parse_ies, Ie, IeSet};
use iax2_proto::WireError;

#[test]
fn test_ie_round_trip_mixed() {
    let ies = vec![
        Ie::Version(2),
        Ie::CalledNumber("18005551212".into()),
        Ie::CallingNumber("100".into()),
        Ie::CallingName("Alice".into()),
        Ie::Username("alice".into()),
        Ie::Capability(0x0004_0006),
        Ie::Format(0x0000_0004),
        Ie::AuthMethods(2),
        Ie::Challenge("338429".into()),
        Ie::Refresh(60),
        Ie::CallingPres(0),
        Ie::TransferId(0xDEAD_BEEF),
        Ie::Encryption(0x8001),
        Ie::AutoAnswer,
        Ie::CallToken(vec![]),
        Ie::CallToken(b"1700000000?aabbcc".to_vec()),
        Ie::Unknown {
            ie: 200,
            data: vec![1, 2, 3],
        },
    ];
    let bytes = build_ies(&ies);
    let decoded = parse_ies(&bytes).unwrap();
    assert_eq!(decoded, ies);
}

#[test]
fn test_versioned_codec_ies() {
    let ies = vec![Ie::Capability2(1u64 << 34 | 1 << 2), Ie::Format2(1u64 << 34)];
    let bytes = build_ies(&ies);
    // version byte + 8 value bytes, so 9 on the wire
    assert_eq!(bytes[1], 9);
    assert_eq!(parse_ies(&bytes).unwrap(), ies);
}

#[test]
fn test_capability2_wins_over_capability() {
    let set = IeSet::from_list(&[
        Ie::Capability2(1u64 << 40),
        Ie::Capability(0x0004),
        Ie::Format(0x0004),
        Ie::Format2(1u64 << 40),
    ]);
    assert_eq!(set.capability, Some(1u64 << 40));
    assert_eq!(set.format, Some(1u64 << 40));
}

#[test]
fn test_apparent_addr_v4_is_sixteen_bytes() {
    let addr: SocketAddr = "198.51.100.7:4569".parse().unwrap();
    let bytes = build_ies(&[Ie::ApparentAddr(addr)]);
    assert_eq!(bytes[1], 16);
    let decoded = parse_ies(&bytes).unwrap();
    assert_eq!(decoded, vec![Ie::ApparentAddr(addr)]);
}

#[test]
fn test_apparent_addr_v6_distinguished_by_length() {
    let addr: SocketAddr = "[2001:db8::7]:4569".parse().unwrap();
    let bytes = build_ies(&[Ie::ApparentAddr(addr)]);
    assert_eq!(bytes[1], 28);
    assert_eq!(parse_ies(&bytes).unwrap(), vec![Ie::ApparentAddr(addr)]);
}

#[test]
fn test_ie_spanning_past_frame_is_error() {
    // Declares 10 bytes of value but only 2 follow.
    let bytes = [6u8, 10, b'h', b'i'];
    assert_eq!(
        parse_ies(&bytes),
        Err(WireError::BadIeLen { ie: 6, len: 10 })
    );
}

#[test]
fn test_trailing_single_byte_is_error() {
    let mut bytes = build_ies(&[Ie::Version(2)]);
    bytes.push(6);
    assert!(parse_ies(&bytes).is_err());
}

#[test]
fn test_empty_calltoken_marks_request() {
    let set = IeSet::parse(&build_ies(&[Ie::CallToken(vec![])])).unwrap();
    assert!(set.calltoken_seen);
    assert!(set.calltoken.is_none());

    let set = IeSet::parse(&build_ies(&[Ie::CallToken(vec![1, 2])])).unwrap();
    assert!(set.calltoken_seen);
    assert_eq!(set.calltoken.as_deref(), Some(&[1u8, 2][..]));
}

#[test]
fn test_sampling_rate_defaults_to_8khz() {
    let set = IeSet::parse(&[]).unwrap();
    assert_eq!(set.samprate, iax2_proto::constants::RATE_8KHZ);
}

#[test]
fn test_mis_sized_numeric_degrades_to_unknown() {
    // VERSION with a 1-byte value.
    let bytes = [11u8, 1, 2];
    let decoded = parse_ies(&bytes).unwrap();
    assert_eq!(
        decoded,
        vec![Ie::Unknown {
            ie: 11,
            data: vec![2]
        }]
    );
}
