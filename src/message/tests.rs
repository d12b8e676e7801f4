use std::num::NonZeroU32;

use crate::codec::Endianness;
use crate::error::Error;
use crate::message::{Flags, Message, MessageKind};
use crate::signature::Signature;
use crate::value::Value;

fn serial(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap()
}

#[rustfmt::skip]
const LE_BLOB: [u8; 36] = [
    // byte 0
    // yyyyuu fixed headers
    b'l',
    // reply (which is the simplest message)
    b'\x02',
    // no auto-starting
    b'\x02',
    // D-Bus version = 1
    b'\x01',
    // byte 4
    // bytes in body = 4
    b'\x04', b'\0', b'\0', b'\0',
    // byte 8
    // serial number = 0x12345678
    b'\x78', b'\x56', b'\x34', b'\x12',
    // byte 12
    // bytes in array of variable headers = 15
    b'\x0f', b'\0', b'\0', b'\0',
    // byte 16
    // in reply to:
    b'\x05',
    // variant signature = u
    b'\x01', b'u', b'\0',
    // 0xabcdef12
    b'\x12', b'\xef', b'\xcd', b'\xab',
    // byte 24
    // signature:
    b'\x08',
    // variant signature = g
    b'\x01', b'g', b'\0',
    // 1 byte, u, NUL
    b'\x01', b'u', b'\0',
    // pad to 8-byte boundary for body
    b'\0',
    // body; byte 32
    // 0xdeadbeef
    b'\xef', b'\xbe', b'\xad', b'\xde',
];

#[rustfmt::skip]
const BE_BLOB: [u8; 36] = [
    b'B',
    b'\x02',
    b'\x02',
    b'\x01',
    b'\0', b'\0', b'\0', b'\x04',
    b'\x12', b'\x34', b'\x56', b'\x78',
    b'\0', b'\0', b'\0', b'\x0f',
    b'\x05',
    b'\x01', b'u', b'\0',
    b'\xab', b'\xcd', b'\xef', b'\x12',
    b'\x08',
    b'\x01', b'g', b'\0',
    b'\x01', b'u', b'\0',
    b'\0',
    b'\xde', b'\xad', b'\xbe', b'\xef',
];

fn reply_message(endianness: Endianness) -> Message {
    Message::method_return(serial(0xabcdef12))
        .with_endianness(endianness)
        .with_flags(Flags::NO_AUTO_START)
        .with_serial(serial(0x12345678))
        .with_body(
            Signature::parse("u").unwrap(),
            &[Value::Uint32(0xdeadbeef)],
        )
        .unwrap()
}

#[test]
fn serialize_blobs() {
    let bytes = reply_message(Endianness::Little).serialize().unwrap();
    assert_eq!(bytes, LE_BLOB);

    let bytes = reply_message(Endianness::Big).serialize().unwrap();
    assert_eq!(bytes, BE_BLOB);
}

#[test]
fn parse_blobs() {
    for (endianness, blob) in [
        (Endianness::Little, &LE_BLOB),
        (Endianness::Big, &BE_BLOB),
    ] {
        let m = Message::parse(&blob[..]).unwrap();
        assert_eq!(m, reply_message(endianness));
        assert_eq!(m.arguments().unwrap(), [Value::Uint32(0xdeadbeef)]);
    }
}

#[test]
fn endianness_of_the_serial_field() {
    let m = Message::method_call("/", "Nop")
        .unwrap()
        .with_serial(serial(0xdeadbeef));

    let be = m.clone().with_endianness(Endianness::Big).serialize().unwrap();
    assert_eq!(&be[8..12], [0xde, 0xad, 0xbe, 0xef]);

    let le = m.with_endianness(Endianness::Little).serialize().unwrap();
    assert_eq!(&le[8..12], [0xef, 0xbe, 0xad, 0xde]);
}

#[test]
fn hello_round_trip() {
    let m = Message::method_call("/org/freedesktop/DBus", "Hello")
        .unwrap()
        .with_interface("org.freedesktop.DBus")
        .with_destination("org.freedesktop.DBus")
        .with_endianness(Endianness::Little)
        .with_serial(serial(1));

    let parsed = Message::parse(&m.serialize().unwrap()).unwrap();

    assert_eq!(
        *parsed.kind(),
        MessageKind::MethodCall {
            path: "/org/freedesktop/DBus".parse().unwrap(),
            member: "Hello".into(),
        }
    );
    assert_eq!(parsed.interface(), Some("org.freedesktop.DBus"));
    assert_eq!(parsed.destination(), Some("org.freedesktop.DBus"));
    assert_eq!(parsed.serial(), Some(serial(1)));
    assert_eq!(parsed, m);
}

#[test]
fn signal_round_trip() {
    let m = Message::signal("/player", "org.example.Player", "Seeked")
        .unwrap()
        .with_sender(":1.42")
        .with_serial(serial(9))
        .with_body(Signature::parse("x").unwrap(), &[Value::Int64(-1)])
        .unwrap();

    let parsed = Message::parse(&m.serialize().unwrap()).unwrap();
    assert_eq!(parsed, m);
    assert_eq!(parsed.interface(), Some("org.example.Player"));
    assert_eq!(parsed.member(), Some("Seeked"));
}

#[test]
fn error_round_trip() {
    let call = Message::method_call("/obj", "Frob")
        .unwrap()
        .with_sender(":1.7")
        .with_serial(serial(4));

    let m = call
        .error_reply("org.freedesktop.DBus.Error.UnknownMethod", "no such method")
        .unwrap()
        .with_serial(serial(5));

    let parsed = Message::parse(&m.serialize().unwrap()).unwrap();
    assert_eq!(parsed.error_name(), Some("org.freedesktop.DBus.Error.UnknownMethod"));
    assert_eq!(parsed.reply_serial(), Some(serial(4)));
    assert_eq!(parsed.destination(), Some(":1.7"));
    assert_eq!(
        parsed.arguments().unwrap(),
        [Value::String("no such method".into())]
    );
}

#[test]
fn serialize_without_serial() {
    let m = Message::method_call("/", "Nop").unwrap();
    assert!(matches!(m.serialize(), Err(Error::InvalidSerial)));
}

#[test]
fn parse_rejects_bad_fixed_header() {
    let good = reply_message(Endianness::Little).serialize().unwrap();

    let mut bad = good.clone();
    bad[0] = b'x';
    assert!(matches!(
        Message::parse(&bad),
        Err(Error::InvalidEndianness(b'x'))
    ));

    let mut bad = good.clone();
    bad[1] = 9;
    assert!(matches!(
        Message::parse(&bad),
        Err(Error::InvalidMessageType(9))
    ));

    let mut bad = good.clone();
    bad[3] = 2;
    assert!(matches!(
        Message::parse(&bad),
        Err(Error::UnsupportedProtocolVersion(2))
    ));

    let mut bad = good.clone();
    bad[8..12].fill(0);
    assert!(matches!(Message::parse(&bad), Err(Error::InvalidSerial)));

    assert!(matches!(
        Message::parse(&good[..12]),
        Err(Error::Truncated)
    ));
}

#[test]
fn parse_rejects_missing_required_fields() {
    // A method call with only a PATH field.
    let m = Message::method_call("/obj", "Frob")
        .unwrap()
        .with_serial(serial(1));
    let bytes = m.serialize().unwrap();

    // Corrupt the MEMBER field code into an unknown one; the parser then
    // sees a method call without MEMBER.
    let mut bad = bytes.clone();
    let member_at = bytes
        .windows(4)
        .position(|w| w == [0x03, 0x01, b's', 0x00])
        .unwrap();
    bad[member_at] = 0xfe;

    assert!(matches!(
        Message::parse(&bad),
        Err(Error::MissingRequiredField("MEMBER"))
    ));
}

#[test]
fn parse_rejects_truncated_body() {
    let bytes = reply_message(Endianness::Little).serialize().unwrap();
    assert!(matches!(
        Message::parse(&bytes[..bytes.len() - 1]),
        Err(Error::Truncated)
    ));
}

#[test]
fn frame_length_math() {
    let bytes = reply_message(Endianness::Little).serialize().unwrap();
    let remaining = super::frame_remaining(&bytes[..16]).unwrap();
    assert_eq!(16 + remaining, bytes.len());

    let hello = Message::method_call("/org/freedesktop/DBus", "Hello")
        .unwrap()
        .with_serial(serial(1))
        .serialize()
        .unwrap();
    let remaining = super::frame_remaining(&hello[..16]).unwrap();
    assert_eq!(16 + remaining, hello.len());
}

#[test]
fn no_reply_expected() {
    let m = Message::method_call("/", "Nop").unwrap();
    assert!(m.expects_reply());

    let m = m.with_flags(Flags::NO_REPLY_EXPECTED);
    assert!(!m.expects_reply());

    assert!(!Message::method_return(serial(1)).expects_reply());
}

#[test]
fn unknown_flags_are_ignored_on_parse() {
    let mut bytes = reply_message(Endianness::Little).serialize().unwrap();
    bytes[2] |= 0xf0;
    let m = Message::parse(&bytes).unwrap();
    assert_eq!(m.flags(), Flags::NO_AUTO_START);
}
