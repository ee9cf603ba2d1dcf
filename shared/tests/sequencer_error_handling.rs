/// Tests for the datagram sequencer: in-order delivery, regression drops,
/// miss accounting and send-record retirement via acknowledgments.
use tether_shared::{DatagramSequencer, DownstreamMessage, UpstreamMessage, WireWriter};

/// Builds a raw sequenced payload as the *server* side would: sequence
/// number, ack number, then a downstream message body.
fn server_payload(number: u32, ack: u32, oid: i32) -> Vec<u8> {
    let mut writer = WireWriter::new();
    writer.write_u32(number);
    writer.write_u32(ack);
    DownstreamMessage::UnsubscribeResponse { oid }.ser(&mut writer);
    writer.into_bytes()
}

#[test]
fn delivery_is_strictly_increasing_with_misses_counted() {
    let mut sequencer = DatagramSequencer::new();

    let mut delivered = Vec::new();
    for number in [1u32, 2, 4, 3, 5] {
        let payload = server_payload(number, 0, number as i32);
        if let Some(message) = sequencer.read_datagram(&payload, 0).unwrap() {
            match message {
                DownstreamMessage::UnsubscribeResponse { oid } => delivered.push(oid),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    assert_eq!(delivered, vec![1, 2, 4, 5]);
    assert_eq!(sequencer.missed(), 1);
}

#[test]
fn duplicate_datagram_is_dropped() {
    let mut sequencer = DatagramSequencer::new();
    let payload = server_payload(1, 0, 1);
    assert!(sequencer.read_datagram(&payload, 0).unwrap().is_some());
    assert!(sequencer.read_datagram(&payload, 0).unwrap().is_none());
    assert_eq!(sequencer.missed(), 1);
}

#[test]
fn outbound_sequence_numbers_increase() {
    let mut sequencer = DatagramSequencer::new();
    let first = sequencer.write_datagram(&UpstreamMessage::Ping);
    let second = sequencer.write_datagram(&UpstreamMessage::Ping);

    let number = |payload: &[u8]| {
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
    };
    assert_eq!(number(&first), 1);
    assert_eq!(number(&second), 2);
    assert_eq!(sequencer.in_flight(), 2);
}

#[test]
fn acknowledgments_retire_send_records() {
    let mut sequencer = DatagramSequencer::new();
    sequencer.write_datagram(&UpstreamMessage::Ping);
    sequencer.write_datagram(&UpstreamMessage::Ping);
    sequencer.write_datagram(&UpstreamMessage::Ping);
    assert_eq!(sequencer.in_flight(), 3);

    // the server acknowledges having seen our datagram 2
    let payload = server_payload(1, 2, 7);
    sequencer.read_datagram(&payload, 0).unwrap();
    assert_eq!(sequencer.in_flight(), 1);
    assert_eq!(sequencer.acknowledged(), 2);
}

#[test]
fn unparseable_payload_is_an_error_for_the_caller_to_drop() {
    let mut sequencer = DatagramSequencer::new();
    let mut writer = WireWriter::new();
    writer.write_u32(1);
    writer.write_u32(0);
    writer.write_u8(0xEE); // no such downstream tag
    assert!(sequencer.read_datagram(&writer.into_bytes(), 0).is_err());
}

#[test]
fn verification_failures_are_accounted() {
    let mut sequencer = DatagramSequencer::new();
    sequencer.note_failed();
    sequencer.note_failed();
    assert_eq!(sequencer.missed(), 2);
}
