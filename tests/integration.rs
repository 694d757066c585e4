//! Cross-module integration tests.
//!
//! These exercise `proto`, `fixedbuf`, `table`, and `connection::ConnTokens`
//! together the way the daemon actually composes them, without opening a
//! real socket or spawning a real child process; that end-to-end path
//! needs a live host and is exercised by judgement/code-reading rather than
//! an automated test (see `SPEC_FULL.md`).

use ice9::connection::ConnTokens;
use ice9::fixedbuf::FixedBuf;
use ice9::proto::{self, client_tag, server_tag};
use ice9::table::SlotTable;

/// Scenario 1 from §8: a server's send buffer accumulates an `O` frame, an
/// empty `O` (stdout EOF), an empty `E` (stderr EOF), and an `X 0`, and a
/// reader walking the buffer the way the client does recovers exactly that
/// sequence.
#[test]
fn echo_session_frame_sequence_round_trips_through_a_shared_buffer() {
    let mut send = FixedBuf::with_capacity(4096);

    for (tag, payload) in [
        (server_tag::STDOUT, b"hi\r\n".as_slice()),
        (server_tag::STDOUT, b"".as_slice()),
        (server_tag::STDERR, b"".as_slice()),
    ] {
        let mut frame = Vec::new();
        proto::encode_frame(&mut frame, tag, payload);
        assert!(send.try_append(&frame));
    }
    let mut exit_frame = Vec::new();
    proto::encode_frame(&mut exit_frame, server_tag::EXIT, &proto::encode_exit_code(0));
    assert!(send.try_append(&exit_frame));

    let mut decoded = Vec::new();
    while let Some(header) = proto::peek_frame(send.as_slice()) {
        let frame_len = proto::encoded_len(header.payload_len);
        let payload = send.as_slice()[proto::HEADER_LEN..frame_len].to_vec();
        decoded.push((header.tag, payload));
        send.consume(frame_len);
    }

    assert_eq!(decoded.len(), 4);
    assert_eq!(decoded[0], (server_tag::STDOUT, b"hi\r\n".to_vec()));
    assert_eq!(decoded[1], (server_tag::STDOUT, Vec::new()));
    assert_eq!(decoded[2], (server_tag::STDERR, Vec::new()));
    assert_eq!(decoded[3].0, server_tag::EXIT);
    assert_eq!(proto::decode_exit_code(&decoded[3].1), Some(0));
}

/// Boundaries (§8): a payload exactly filling the remaining send-buffer
/// capacity succeeds; one byte more must be rejected before any partial
/// write, the same check `Connection::queue_frame` performs before ever
/// touching the buffer.
#[test]
fn frame_exactly_filling_remaining_capacity_succeeds_one_byte_more_is_rejected() {
    let mut send = FixedBuf::with_capacity(proto::HEADER_LEN + 10);
    let exact = vec![0x42; 10];
    let mut frame = Vec::new();
    proto::encode_frame(&mut frame, client_tag::STDIN, &exact);
    assert_eq!(frame.len(), send.capacity());
    assert!(proto::encoded_len(exact.len()) <= send.free());
    assert!(send.try_append(&frame));
    assert_eq!(send.free(), 0);

    let mut send = FixedBuf::with_capacity(proto::HEADER_LEN + 10);
    let too_big = vec![0x42; 11];
    let mut frame = Vec::new();
    proto::encode_frame(&mut frame, client_tag::STDIN, &too_big);
    assert!(proto::encoded_len(too_big.len()) > send.free());
    assert!(!send.try_append(&frame));
    assert!(send.is_empty(), "a rejected append must not partially land");
}

/// §8 invariant 5: slot identifiers never change, and a connection's socket
/// token is a pure function of identifier, so it survives any amount of
/// churn among the *other* occupants of the table, even though its own slot
/// index can shift underneath it. Pipe and child-exit completions no longer
/// carry their own tokens (they wake the server's one shared `Waker`
/// instead), so the only token left to check here is the socket's.
#[test]
fn connection_tokens_are_stable_across_table_churn_and_never_collide() {
    let first = ConnTokens::for_id(0, 1);
    let second = ConnTokens::for_id(1, 1);

    let mut table: SlotTable<u64> = SlotTable::new(16);
    for id in 0..16u64 {
        table.insert(id);
    }
    table.remove(3); // simulate connection 3 closing
    table.remove(0); // simulate connection 0 (now at index 0) closing
    table.insert(16);

    assert_eq!(ConnTokens::for_id(0, 1), first, "tokens depend only on id, not slot index");
    assert_eq!(ConnTokens::for_id(1, 1), second);
    assert_ne!(first.socket, second.socket, "no two connections may share a socket token");
}

/// §8 invariant 5, dense-prefix half: after arbitrary insert/remove churn,
/// occupied slots remain exactly `0..len()` with no gaps.
#[test]
fn table_stays_dense_after_mixed_insert_and_remove_churn() {
    let mut table: SlotTable<u64> = SlotTable::new(16);
    for id in 0..16u64 {
        table.insert(id);
    }
    assert!(table.is_full());

    for &victim in &[7, 2, 0, 12] {
        let idx = table.position(|&v| v == victim).expect("victim present");
        table.remove(idx);
    }
    assert_eq!(table.len(), 12);
    for i in 0..table.len() {
        assert!(table.get(i).is_some(), "slot {i} must be populated in a dense table");
    }

    table.insert(100);
    table.insert(101);
    assert_eq!(table.len(), 14);
    assert!(table.capacity() >= table.len());
}
