/// Tests for the reliable stream framing layer: whole-frame round trips,
/// partial-prefix rejection and framing-buffer reset after failed sends.
use std::io::{self, Write};

use tether_shared::{
    decode_upstream, DEvent, DValue, FrameError, FrameReader, FrameWriter, UpstreamMessage,
};

fn sample_messages() -> Vec<UpstreamMessage> {
    vec![
        UpstreamMessage::Subscribe { oid: 42 },
        UpstreamMessage::Unsubscribe { oid: 7 },
        UpstreamMessage::Ping,
        UpstreamMessage::Logoff,
        UpstreamMessage::TransmitDatagrams { connection_id: 9001 },
        UpstreamMessage::ForwardEvent {
            event: DEvent::Message {
                target_oid: 3,
                name: "chat".into(),
                args: vec![DValue::Str("hello".into()), DValue::Int(5)],
            },
        },
    ]
}

#[test]
fn frame_round_trip() {
    for message in sample_messages() {
        let mut sink = Vec::new();
        let mut writer = FrameWriter::new();
        writer.write_message(&mut sink, &message).unwrap();

        let mut reader = FrameReader::new();
        reader.feed(&sink);
        let frame = reader.next_frame().unwrap().expect("complete frame");
        assert_eq!(decode_upstream(&frame).unwrap(), message);
        // nothing left over
        assert!(reader.next_frame().unwrap().is_none());
    }
}

#[test]
fn partial_prefixes_never_decode() {
    let message = UpstreamMessage::ForwardEvent {
        event: DEvent::AttributeChanged {
            target_oid: 12,
            name: "health".into(),
            value: DValue::Int(99),
        },
    };
    let mut sink = Vec::new();
    FrameWriter::new().write_message(&mut sink, &message).unwrap();

    for cut in 0..sink.len() {
        let mut reader = FrameReader::new();
        reader.feed(&sink[..cut]);
        assert!(
            reader.next_frame().unwrap().is_none(),
            "prefix of {cut} bytes produced a frame"
        );
    }
}

#[test]
fn frames_accumulate_across_feeds() {
    let mut sink = Vec::new();
    let mut writer = FrameWriter::new();
    writer
        .write_message(&mut sink, &UpstreamMessage::Subscribe { oid: 1 })
        .unwrap();
    writer
        .write_message(&mut sink, &UpstreamMessage::Subscribe { oid: 2 })
        .unwrap();

    // deliver one byte at a time; exactly two frames must come out, in order
    let mut reader = FrameReader::new();
    let mut oids = Vec::new();
    for byte in &sink {
        reader.feed(std::slice::from_ref(byte));
        while let Some(frame) = reader.next_frame().unwrap() {
            match decode_upstream(&frame).unwrap() {
                UpstreamMessage::Subscribe { oid } => oids.push(oid),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }
    assert_eq!(oids, vec![1, 2]);
}

#[test]
fn implausible_length_prefix_is_an_error() {
    let mut reader = FrameReader::new();
    reader.feed(&u32::MAX.to_be_bytes());
    assert!(matches!(
        reader.next_frame(),
        Err(FrameError::FrameTooLarge { .. })
    ));
}

/// A sink that fails on the first write, then functions normally.
struct FlakySink {
    failures_left: usize,
    written: Vec<u8>,
}

impl Write for FlakySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "flaky"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn failed_send_does_not_corrupt_the_next_frame() {
    let mut sink = FlakySink {
        failures_left: 1,
        written: Vec::new(),
    };
    let mut writer = FrameWriter::new();

    assert!(writer
        .write_message(&mut sink, &UpstreamMessage::Subscribe { oid: 5 })
        .is_err());

    // the next send must produce one clean frame, not remnants of the failure
    writer
        .write_message(&mut sink, &UpstreamMessage::Subscribe { oid: 6 })
        .unwrap();

    let mut reader = FrameReader::new();
    reader.feed(&sink.written);
    let frame = reader.next_frame().unwrap().expect("complete frame");
    assert_eq!(
        decode_upstream(&frame).unwrap(),
        UpstreamMessage::Subscribe { oid: 6 }
    );
    assert!(reader.next_frame().unwrap().is_none());
}
