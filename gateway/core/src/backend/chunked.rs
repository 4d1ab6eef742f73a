//! Chunked Text-Stream Decoding
//!
//! Decodes server-sent-event style bodies:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}\n\n
//! data: {"choices":[{"delta":{"content":"lo"}}]}\r\n\r\n
//! data: [DONE]\n\n
//! ```
//!
//! Splitting happens on raw bytes, so network reads that cut through a
//! multi-byte character or a `\r\n` pair are reassembled before decoding.

use std::time::Duration;

use futures::StreamExt;

use super::transport::ByteStream;
use crate::error::{GatewayError, Result};
use crate::pool::InactivityWatchdog;
use crate::streaming::EventStream;

/// Framing conventions of a chunked upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkFormat {
    /// Prefix stripped from every chunk
    pub prefix: String,
    /// Payload marking the end of the reply
    pub sentinel: String,
    /// Field every data chunk must carry
    pub result_field: String,
}

impl Default for ChunkFormat {
    fn default() -> Self {
        Self {
            prefix: "data: ".to_string(),
            sentinel: "[DONE]".to_string(),
            result_field: "choices".to_string(),
        }
    }
}

/// One decoded chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Nothing to emit (blank chunk, empty delta, stop marker)
    Skip,
    /// End-of-reply sentinel
    Sentinel,
    /// Reply text
    Content(String),
    /// Chunk without the expected result field
    Malformed(String),
}

// ============================================================================
// Splitter
// ============================================================================

/// Reassembles blank-line separated chunks from arbitrary byte reads
#[derive(Debug, Default)]
pub struct ChunkSplitter {
    buf: Vec<u8>,
}

impl ChunkSplitter {
    /// Create an empty splitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every chunk completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some((end, next)) = find_boundary(&self.buf) {
            let chunk = String::from_utf8_lossy(&self.buf[..end]).into_owned();
            self.buf.drain(..next);
            chunks.push(chunk);
        }
        chunks
    }

    /// Whatever remains once the body has closed
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

/// Locate `\r?\n\r?\n`; returns (chunk end, start of next chunk)
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, byte) in buf.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let mut j = i + 1;
        if buf.get(j) == Some(&b'\r') {
            j += 1;
        }
        if buf.get(j) == Some(&b'\n') {
            let end = if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i };
            return Some((end, j + 1));
        }
    }
    None
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one chunk
#[must_use]
pub fn decode_chunk(chunk: &str, format: &ChunkFormat) -> Decoded {
    let trimmed = chunk.trim();
    let data = trimmed.strip_prefix(format.prefix.as_str()).unwrap_or(trimmed).trim();
    if data.is_empty() {
        return Decoded::Skip;
    }
    if data == format.sentinel {
        return Decoded::Sentinel;
    }

    let missing = || Decoded::Malformed(format!("not found data.{}", format.result_field));
    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        return missing();
    };
    let Some(results) = value.get(&format.result_field) else {
        return missing();
    };

    let Some(first) = results.get(0) else {
        return Decoded::Skip;
    };
    if first.get("finish_reason").and_then(|r| r.as_str()) == Some("stop") {
        return Decoded::Skip;
    }
    match first
        .pointer("/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.is_empty() => Decoded::Content(content.to_string()),
        _ => Decoded::Skip,
    }
}

/// Decode a body into `stream` until it ends, fails or stalls
///
/// Always leaves `stream` closed with exactly one terminal event. Returns the
/// failure, if any, so the caller can do its pool bookkeeping.
pub async fn pump(
    mut body: ByteStream,
    stream: &EventStream,
    format: &ChunkFormat,
    stall_timeout: Duration,
) -> Result<()> {
    let watchdog = InactivityWatchdog::start(stall_timeout);
    let mut splitter = ChunkSplitter::new();

    loop {
        tokio::select! {
            next = body.next() => match next {
                Some(Ok(bytes)) => {
                    watchdog.touch();
                    for chunk in splitter.push(&bytes) {
                        if let Some(outcome) = apply(&chunk, stream, format) {
                            return outcome;
                        }
                    }
                }
                Some(Err(e)) => {
                    stream.fail(e.to_string());
                    return Err(e);
                }
                None => {
                    if let Some(rest) = splitter.finish() {
                        if let Some(outcome) = apply(&rest, stream, format) {
                            return outcome;
                        }
                    }
                    stream.finish();
                    return Ok(());
                }
            },
            () = watchdog.expired() => {
                let err = GatewayError::Stalled(stall_timeout);
                stream.fail(err.to_string());
                return Err(err);
            }
        }
    }
}

/// Apply one chunk; `Some` once the reply is over
fn apply(chunk: &str, stream: &EventStream, format: &ChunkFormat) -> Option<Result<()>> {
    match decode_chunk(chunk, format) {
        Decoded::Skip => None,
        Decoded::Content(content) => {
            stream.message(content);
            None
        }
        Decoded::Sentinel => {
            stream.finish();
            Some(Ok(()))
        }
        Decoded::Malformed(reason) => {
            stream.fail(reason.clone());
            Some(Err(GatewayError::Malformed(reason)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::ChatEvent;
    use crate::test_utils::{body_from, sse};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_handles_crlf_and_partial_reads() {
        let mut splitter = ChunkSplitter::new();
        assert!(splitter.push(b"data: a\r").is_empty());
        assert!(splitter.push(b"\n\r").is_empty());
        assert_eq!(splitter.push(b"\ndata: b\n\ndata: c"), vec!["data: a", "data: b"]);
        assert_eq!(splitter.finish().as_deref(), Some("data: c"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_split_reassembles_utf8() {
        let text = "data: héllo\n\n".as_bytes();
        // Cut inside the two-byte 'é'.
        let cut = 8;
        let mut splitter = ChunkSplitter::new();
        assert!(splitter.push(&text[..cut]).is_empty());
        assert_eq!(splitter.push(&text[cut..]), vec!["data: héllo"]);
    }

    #[test]
    fn test_decode_chunk_variants() {
        let format = ChunkFormat::default();
        assert_eq!(decode_chunk("", &format), Decoded::Skip);
        assert_eq!(decode_chunk("data: [DONE]", &format), Decoded::Sentinel);
        assert_eq!(
            decode_chunk(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#, &format),
            Decoded::Content("hi".into())
        );
        assert_eq!(
            decode_chunk(
                r#"data: {"choices":[{"delta":{"content":"x"},"finish_reason":"stop"}]}"#,
                &format
            ),
            Decoded::Skip
        );
        assert_eq!(
            decode_chunk(r#"data: {"error":"quota"}"#, &format),
            Decoded::Malformed("not found data.choices".into())
        );
        assert_eq!(
            decode_chunk("data: not json", &format),
            Decoded::Malformed("not found data.choices".into())
        );
    }

    #[tokio::test]
    async fn test_pump_concatenates_until_sentinel() {
        let stream = EventStream::new();
        let body = body_from(vec![sse("Hel"), sse("lo"), "data: [DONE]\n\n".to_string()]);
        pump(body, &stream, &ChunkFormat::default(), Duration::from_secs(5))
            .await
            .unwrap();

        let response = stream.collect().await;
        assert_eq!(response.content, "Hello");
        assert_eq!(response.error, None);
        assert!(stream.is_ended());
    }

    #[tokio::test]
    async fn test_pump_done_on_close_without_sentinel() {
        let stream = EventStream::new();
        pump(body_from(vec![sse("x")]), &stream, &ChunkFormat::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            stream.events().last(),
            Some(&ChatEvent::Done {
                content: String::new()
            })
        );
    }

    #[tokio::test]
    async fn test_pump_malformed_emits_single_error() {
        let stream = EventStream::new();
        let body = body_from(vec![
            "data: {\"detail\":\"nope\"}\n\n".to_string(),
            sse("ignored"),
        ]);
        let err = pump(body, &stream, &ChunkFormat::default(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Malformed(_)));
        assert_eq!(
            stream.events(),
            vec![ChatEvent::Error {
                error: "not found data.choices".into()
            }]
        );
        assert!(stream.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_stalls() {
        let stream = EventStream::new();
        let body: ByteStream = Box::pin(futures::stream::pending());
        let err = pump(body, &stream, &ChunkFormat::default(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Stalled(_)));
        assert!(stream.collect().await.error.is_some());
    }
}
