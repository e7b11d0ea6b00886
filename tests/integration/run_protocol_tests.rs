//! Integration tests for the /run wire format and the frame codec
//!
//! These tests verify that:
//! - Request and response bodies keep the camelCase field names clients send
//! - Multiplexed and unframed sandbox output decode to the same text
//! - Output split at arbitrary points decodes the same as one buffer

use bytes::BytesMut;
use coderun_common::{ErrorResponse, RunRequest, RunResponse};
use coderun_sandbox::{decode_text, demux, encode_frame, FrameDecoder, OutputChunk, StreamKind};
use serde_json::json;
use tokio_util::codec::Decoder;

fn decode_in_pieces(wire: &[u8], piece: usize) -> (String, bool) {
    let mut decoder = FrameDecoder::default();
    let mut buffer = BytesMut::new();
    let mut chunks: Vec<OutputChunk> = Vec::new();

    for part in wire.chunks(piece) {
        buffer.extend_from_slice(part);
        while let Some(chunk) = decoder.decode(&mut buffer).unwrap() {
            chunks.push(chunk);
        }
    }
    while let Some(chunk) = decoder.decode_eof(&mut buffer).unwrap() {
        chunks.push(chunk);
    }
    let text = chunks.iter().map(|chunk| chunk.text()).collect();
    (text, decoder.is_raw())
}

#[test]
fn test_request_field_names() {
    let request: RunRequest = serde_json::from_value(json!({
        "code": "",
        "input": "5",
        "containerId": "abc"
    }))
    .unwrap();
    assert_eq!(request.container_id.as_deref(), Some("abc"));
    assert_eq!(request.input.as_deref(), Some("5"));

    // A bare continuation may omit code entirely
    let request: RunRequest =
        serde_json::from_value(json!({ "containerId": "abc", "input": "" })).unwrap();
    assert_eq!(request.code, "");
    assert_eq!(request.input.as_deref(), Some(""));
}

#[test]
fn test_response_omits_container_id_once_ended() {
    let ended = RunResponse {
        output: "hi\n".to_string(),
        requires_input: false,
        container_id: None,
    };
    assert_eq!(
        serde_json::to_value(&ended).unwrap(),
        json!({ "output": "hi\n", "requiresInput": false })
    );

    let live = RunResponse {
        output: "Enter first number: ".to_string(),
        requires_input: true,
        container_id: Some("abc".to_string()),
    };
    assert_eq!(serde_json::to_value(&live).unwrap()["containerId"], "abc");
}

#[test]
fn test_error_body_shape() {
    let body = ErrorResponse::new("Failed to process the request.").with_details("boom");
    assert_eq!(
        serde_json::to_value(&body).unwrap(),
        json!({ "error": "Failed to process the request.", "details": "boom" })
    );
    assert_eq!(
        serde_json::to_value(ErrorResponse::new("missing")).unwrap(),
        json!({ "error": "missing" })
    );
}

#[test]
fn test_split_frames_decode_like_whole_buffer() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&encode_frame(StreamKind::Stdout, b"Enter first number: "));
    wire.extend_from_slice(&encode_frame(StreamKind::Stderr, b"warning\n"));
    wire.extend_from_slice(&encode_frame(StreamKind::Stdout, "r\u{e9}sultat\n".as_bytes()));

    let whole = decode_text(&wire);
    for piece in [1, 3, 7, 8, 9, 64] {
        let (text, raw) = decode_in_pieces(&wire, piece);
        assert_eq!(text, whole, "piece size {piece}");
        assert!(!raw);
    }
}

#[test]
fn test_unframed_output_passes_through() {
    let tty = b"Enter first number: ";
    let (text, raw) = decode_in_pieces(tty, 5);
    assert_eq!(text, "Enter first number: ");
    assert!(raw);
    assert_eq!(decode_text(tty), "Enter first number: ");
}

#[test]
fn test_demux_separates_streams() {
    let chunks = vec![
        OutputChunk::new(StreamKind::Stdout, "a"),
        OutputChunk::new(StreamKind::Stderr, "b"),
        OutputChunk::new(StreamKind::Stdout, "c"),
    ];
    let split = demux(&chunks);
    assert_eq!(split.stdout, b"ac");
    assert_eq!(split.stderr, b"b");
}
