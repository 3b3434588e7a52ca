use std::io::Cursor;

use serde_json::{Value, json};

use crate::stdio::{FramingMode, read_stdio_message, write_stdio_message};

fn read_all(input: &[u8]) -> Vec<(Option<Value>, FramingMode)> {
    let mut reader = Cursor::new(input.to_vec());
    let mut messages = Vec::new();
    loop {
        let (message, mode) = read_stdio_message(&mut reader).unwrap();
        let done = message.is_none();
        messages.push((message, mode));
        if done {
            break;
        }
    }
    messages
}

#[test]
fn json_lines_are_detected_from_the_first_byte() {
    let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n";
    let mut reader = Cursor::new(input.to_vec());
    let (message, mode) = read_stdio_message(&mut reader).unwrap();
    assert_eq!(mode, FramingMode::JsonLines);
    assert_eq!(message.unwrap()["method"], "initialize");
}

#[test]
fn content_length_frames_are_detected_and_read_exactly() {
    let payload = json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}).to_string();
    let input = format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload);
    let mut reader = Cursor::new(input.into_bytes());
    let (message, mode) = read_stdio_message(&mut reader).unwrap();
    assert_eq!(mode, FramingMode::Framed);
    assert_eq!(message.unwrap()["method"], "ping");
}

#[test]
fn blank_lines_before_the_first_message_are_skipped() {
    let input = b"\r\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n";
    let mut reader = Cursor::new(input.to_vec());
    let (message, mode) = read_stdio_message(&mut reader).unwrap();
    assert_eq!(mode, FramingMode::JsonLines);
    assert_eq!(message.unwrap()["method"], "ping");
}

#[test]
fn extra_headers_are_tolerated() {
    let payload = json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}).to_string();
    let input = format!(
        "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
        payload.len(),
        payload
    );
    let mut reader = Cursor::new(input.into_bytes());
    let (message, _mode) = read_stdio_message(&mut reader).unwrap();
    assert_eq!(message.unwrap()["id"], 3);
}

#[test]
fn missing_content_length_is_an_error() {
    let input = b"Content-Type: application/json\r\n\r\n{}";
    let mut reader = Cursor::new(input.to_vec());
    let err = read_stdio_message(&mut reader).unwrap_err();
    assert!(err.to_string().contains("Missing Content-Length"));
}

#[test]
fn malformed_header_line_is_an_error() {
    let input = b"this is not a header\r\n\r\n";
    let mut reader = Cursor::new(input.to_vec());
    let err = read_stdio_message(&mut reader).unwrap_err();
    assert!(err.to_string().contains("Malformed header"));
}

#[test]
fn invalid_content_length_value_is_an_error() {
    let input = b"Content-Length: twelve\r\n\r\n{}";
    let mut reader = Cursor::new(input.to_vec());
    let err = read_stdio_message(&mut reader).unwrap_err();
    assert!(err.to_string().contains("Invalid Content-Length"));
}

#[test]
fn invalid_json_payloads_are_errors_in_both_modes() {
    let mut reader = Cursor::new(b"{not json}\n".to_vec());
    assert!(read_stdio_message(&mut reader).is_err());

    let mut reader = Cursor::new(b"Content-Length: 3\r\n\r\nnot".to_vec());
    assert!(read_stdio_message(&mut reader).is_err());
}

#[test]
fn short_payload_reads_as_eof() {
    let input = b"Content-Length: 100\r\n\r\n{\"partial\":true}";
    let mut reader = Cursor::new(input.to_vec());
    let (message, mode) = read_stdio_message(&mut reader).unwrap();
    assert!(message.is_none());
    assert_eq!(mode, FramingMode::Framed);
}

#[test]
fn empty_input_is_eof() {
    let mut reader = Cursor::new(Vec::new());
    let (message, mode) = read_stdio_message(&mut reader).unwrap();
    assert!(message.is_none());
    assert_eq!(mode, FramingMode::Framed);
}

#[test]
fn framed_writer_emits_the_exact_header_block() {
    let message = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
    let mut output = Vec::new();
    write_stdio_message(&mut output, &message, FramingMode::Framed).unwrap();

    let payload = serde_json::to_vec(&message).unwrap();
    let expected_header = format!("Content-Length: {}\r\n\r\n", payload.len());
    assert!(output.starts_with(expected_header.as_bytes()));
    assert_eq!(&output[expected_header.len()..], payload.as_slice());
}

#[test]
fn jsonl_writer_emits_one_line_without_headers() {
    let message = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
    let mut output = Vec::new();
    write_stdio_message(&mut output, &message, FramingMode::JsonLines).unwrap();

    let text = String::from_utf8(output).unwrap();
    assert!(!text.contains("Content-Length"));
    assert!(text.ends_with('\n'));
    let reparsed: Value = serde_json::from_str(text.trim()).unwrap();
    assert_eq!(reparsed, message);
}

#[test]
fn sequences_round_trip_in_framed_mode() {
    let messages = vec![
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}),
        json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "system.health"}}),
    ];
    let mut buffer = Vec::new();
    for message in &messages {
        write_stdio_message(&mut buffer, message, FramingMode::Framed).unwrap();
    }

    let read_back = read_all(&buffer);
    assert_eq!(read_back.len(), messages.len() + 1);
    for (index, message) in messages.iter().enumerate() {
        let (read_message, mode) = &read_back[index];
        assert_eq!(read_message.as_ref().unwrap(), message);
        assert_eq!(*mode, FramingMode::Framed);
    }
}

#[test]
fn sequences_round_trip_in_jsonl_mode() {
    let messages = vec![
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
    ];
    let mut buffer = Vec::new();
    for message in &messages {
        write_stdio_message(&mut buffer, message, FramingMode::JsonLines).unwrap();
    }

    let read_back = read_all(&buffer);
    for (index, message) in messages.iter().enumerate() {
        let (read_message, mode) = &read_back[index];
        assert_eq!(read_message.as_ref().unwrap(), message);
        assert_eq!(*mode, FramingMode::JsonLines);
    }
}

#[test]
fn batch_arrays_parse_as_arrays_for_the_server_to_reject() {
    let mut reader = Cursor::new(b"[{\"jsonrpc\":\"2.0\"}]\n".to_vec());
    let (message, mode) = read_stdio_message(&mut reader).unwrap();
    assert_eq!(mode, FramingMode::JsonLines);
    assert!(message.unwrap().is_array());
}
