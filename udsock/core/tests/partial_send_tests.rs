//! Large records through a deliberately small socket buffer
//!
//! The kernel cannot take these records in one `sendmsg`; the receiver must
//! still see every byte exactly once, in order.

use std::thread;

use udsock_core::{MessageType, ReadOutcome, Record, RecordDecoder, Socket, SocketKind};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn receive_records(socket: &Socket, count: usize) -> Vec<udsock_core::DecodedRecord> {
    let mut decoder = RecordDecoder::new();
    let mut records = Vec::new();
    let mut buf = vec![0u8; 1500];

    while records.len() < count {
        let len = buf.len();
        match socket.read_into(&mut buf, 0, len).unwrap() {
            ReadOutcome::Data(n) => decoder.push(&buf[..n]),
            ReadOutcome::EndOfStream => break,
        }
        while let Some(record) = decoder.decode().unwrap() {
            records.push(record);
        }
    }
    records
}

#[test]
fn test_large_record_through_small_send_buffer() {
    let (receiver, sender) = Socket::pair(SocketKind::Stream).unwrap();
    sender.set_send_buffer_size(4096).unwrap();

    let payload = pattern(1024 * 1024, 3);
    let metadata = pattern(70_000, 9);
    let record = Record::new(MessageType::Journal, &payload, &metadata);

    let received = thread::scope(|scope| {
        let reader = scope.spawn(|| receive_records(&receiver, 1));
        let sent = sender.send_record(&record).unwrap();
        assert_eq!(sent, record.wire_len());
        reader.join().unwrap()
    });

    assert_eq!(received.len(), 1);
    assert_eq!(received[0].header, record.header());
    assert!(received[0].payload == payload, "payload corrupted");
    assert!(received[0].metadata == metadata, "metadata corrupted");
}

#[test]
fn test_back_to_back_records_keep_boundaries() {
    let (receiver, sender) = Socket::pair(SocketKind::Stream).unwrap();
    sender.set_send_buffer_size(2048).unwrap();

    let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| pattern(40_000 + usize::from(i), i)).collect();

    let received = thread::scope(|scope| {
        let reader = scope.spawn(|| receive_records(&receiver, payloads.len()));
        for (i, payload) in payloads.iter().enumerate() {
            let meta = format!("record-{i}");
            sender
                .send_record(&Record::new(MessageType::Log, payload, meta.as_bytes()))
                .unwrap();
        }
        reader.join().unwrap()
    });

    assert_eq!(received.len(), payloads.len());
    for (i, (record, payload)) in received.iter().zip(&payloads).enumerate() {
        assert!(&record.payload == payload, "record {i} payload corrupted");
        assert_eq!(record.metadata, format!("record-{i}").into_bytes());
    }
}
