// Pinned byte vectors for the vehicle envelope format. These bytes are
// shared with the fleet firmware; a mismatch here is a wire break, not a
// refactoring opportunity.
use bytes::Bytes;
use fleetline_wire::{Envelope, TOPIC_VEHICLE_DATA};

struct Vector {
    name: &'static str,
    envelope: Envelope,
    frame_hex: &'static str,
}

fn vectors() -> Vec<Vector> {
    vec![
        Vector {
            name: "vehicle data record",
            envelope: Envelope {
                txid: Bytes::from_static(b"\x00\x01"),
                sender_id: Bytes::from_static(b"vehicle_device.d1"),
                message_topic: Bytes::from_static(b"V"),
                payload: Bytes::from_static(b"payload"),
            },
            frame_hex: "0000002b00000002000100000011\
                        76656869636c655f6465766963652e6431\
                        0000000156000000077061796c6f6164",
        },
        Vector {
            name: "ack frame",
            envelope: Envelope::ack(
                Bytes::from_static(b"\x00\x01"),
                Bytes::from_static(b"vehicle_device.d1"),
                TOPIC_VEHICLE_DATA,
            ),
            frame_hex: "0000002700000002000100000011\
                        76656869636c655f6465766963652e6431\
                        0000000361636b0000000156",
        },
        Vector {
            name: "empty payload",
            envelope: Envelope {
                txid: Bytes::from_static(b"\xff"),
                sender_id: Bytes::from_static(b"vehicle_device.x"),
                message_topic: Bytes::from_static(b"alerts"),
                payload: Bytes::new(),
            },
            frame_hex: "0000002700000001ff00000010\
                        76656869636c655f6465766963652e78\
                        00000006616c6572747300000000",
        },
    ]
}

#[test]
fn vectors_match_envelope_encoding() {
    for vector in vectors() {
        let expected = Bytes::from(hex_to_bytes(vector.frame_hex));
        assert_eq!(
            vector.envelope.encode().as_ref(),
            expected.as_ref(),
            "encode mismatch for {}",
            vector.name
        );
        let decoded = Envelope::decode(expected).expect("decode");
        assert_eq!(decoded, vector.envelope, "decode mismatch for {}", vector.name);
    }
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    assert!(hex.len() % 2 == 0, "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = from_hex_char(pair[0]) << 4;
            let lo = from_hex_char(pair[1]);
            hi | lo
        })
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
