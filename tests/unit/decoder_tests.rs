//! Unit tests for the incremental NDJSON line decoder.
//!
//! Covers chunk-boundary independence, CRLF handling, the single final
//! flush at exit, and recovery after an oversized line.

use agent_relay::exec::decoder::LineDecoder;

const STREAM: &str = concat!(
    "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s-1\"}\n",
    "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"héllo\"}]}}\n",
    "\n",
    "{\"type\":\"result\",\"result\":\"done\"}\n",
);

fn decode_all(chunks: &[&[u8]]) -> Vec<String> {
    let mut decoder = LineDecoder::new();
    let mut lines = Vec::new();
    for chunk in chunks {
        lines.extend(decoder.feed(chunk));
    }
    lines.extend(decoder.finish());
    lines
}

// ── Chunking ────────────────────────────────────────────────────────────────

/// Splitting the stream at every possible byte offset yields the same lines
/// as feeding it whole, including splits inside a multi-byte character.
#[test]
fn lines_are_independent_of_chunk_boundaries() {
    let bytes = STREAM.as_bytes();
    let whole = decode_all(&[bytes]);
    assert_eq!(whole.len(), 4, "three objects plus one empty line");

    for split in 0..=bytes.len() {
        let (a, b) = bytes.split_at(split);
        assert_eq!(decode_all(&[a, b]), whole, "split at byte {split}");
    }
}

/// Feeding one byte at a time still yields every line in order.
#[test]
fn byte_by_byte_feeding_yields_all_lines() {
    let chunks: Vec<&[u8]> = STREAM.as_bytes().chunks(1).collect();
    let lines = decode_all(&chunks);
    assert_eq!(lines.first().map(String::as_str), Some("{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s-1\"}"));
    assert_eq!(lines.last().map(String::as_str), Some("{\"type\":\"result\",\"result\":\"done\"}"));
}

/// A fragment without a newline is retained and not emitted.
#[test]
fn incomplete_fragment_is_buffered() {
    let mut decoder = LineDecoder::new();
    assert!(decoder.feed(b"{\"type\":\"assis").is_empty());
    assert_eq!(decoder.pending_len(), 14);

    let lines = decoder.feed(b"tant\"}\n");
    assert_eq!(lines, vec!["{\"type\":\"assistant\"}".to_owned()]);
    assert_eq!(decoder.pending_len(), 0);
}

/// `\r\n` terminators are stripped like `\n`.
#[test]
fn crlf_terminators_are_stripped() {
    let mut decoder = LineDecoder::new();
    let lines = decoder.feed(b"{\"a\":1}\r\n{\"b\":2}\r\n");
    assert_eq!(lines, vec!["{\"a\":1}".to_owned(), "{\"b\":2}".to_owned()]);
}

/// Invalid UTF-8 inside a line is replaced rather than dropping the line.
#[test]
fn invalid_utf8_is_replaced_not_dropped() {
    let mut decoder = LineDecoder::new();
    let lines = decoder.feed(b"{\"type\":\"assistant\",\"x\":\"\xff\"}\n{\"type\":\"ok\"}\n");
    assert_eq!(
        lines,
        vec![
            "{\"type\":\"assistant\",\"x\":\"\u{fffd}\"}".to_owned(),
            "{\"type\":\"ok\"}".to_owned(),
        ]
    );
}

// ── Final flush ─────────────────────────────────────────────────────────────

/// The unterminated tail is returned exactly once by `finish`.
#[test]
fn finish_flushes_tail_once() {
    let mut decoder = LineDecoder::new();
    assert!(decoder.feed(b"{\"type\":\"result\"}").is_empty());

    assert_eq!(decoder.finish(), Some("{\"type\":\"result\"}".to_owned()));
    assert_eq!(decoder.finish(), None, "second flush must be empty");
    assert!(decoder.feed(b"late\n").is_empty(), "finished decoder ignores input");
}

/// A whitespace-only tail is not reported.
#[test]
fn finish_ignores_blank_tail() {
    let mut decoder = LineDecoder::new();
    decoder.feed(b"{\"a\":1}\n   ");
    assert_eq!(decoder.finish(), None);
}

// ── Oversized lines ─────────────────────────────────────────────────────────

/// A line beyond the limit is discarded and decoding resumes after it.
#[test]
fn oversized_line_is_discarded_and_decoding_recovers() {
    let mut decoder = LineDecoder::with_max_length(16);
    let mut lines = decoder.feed(b"{\"pad\":\"xxxxxxxxxxxxxxxxxxxxxxxx\"}\n");
    lines.extend(decoder.feed(b"{\"ok\":true}\n"));
    assert_eq!(lines, vec!["{\"ok\":true}".to_owned()]);
    assert_eq!(decoder.max_length(), 16);
}
