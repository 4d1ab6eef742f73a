//! Intercepted Frame Decoding
//!
//! Session backends answer over a socket whose frames are captured from the
//! automated page. A frame looks like:
//!
//! ```text
//! 42["query_progress",{"text":"{\"answer\":\"Hi th\",\"web_results\":[...]}"}]
//! ```
//!
//! The numeric packet code is optional. `answer` is cumulative, so only the
//! suffix beyond the previous frame is emitted, in small character slices.

use serde::Deserialize;

use crate::streaming::EventStream;

/// Frame types and emission granularity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    /// Frame type carrying partial answers
    pub progress_type: String,
    /// Frame type carrying the final answer
    pub answered_type: String,
    /// Characters per emitted message
    pub chunk_chars: usize,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            progress_type: "query_progress".to_string(),
            answered_type: "query_answered".to_string(),
            chunk_chars: 3,
        }
    }
}

/// What a frame meant for the interaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// Partial answer; more frames follow
    Progress,
    /// Final answer; the reply is complete
    Answered,
    /// Unrelated or undecodable frame
    Ignored,
}

#[derive(Debug, Default, Deserialize)]
struct AnswerPayload {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    web_results: Vec<WebResult>,
}

#[derive(Debug, Deserialize)]
struct WebResult {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
}

/// Stateful decoder for one interaction
#[derive(Debug)]
pub struct FrameDecoder {
    format: FrameFormat,
    networked: bool,
    previous: String,
    citations_sent: bool,
}

impl FrameDecoder {
    /// Create a decoder; `networked` enables citation output
    #[must_use]
    pub fn new(format: FrameFormat, networked: bool) -> Self {
        Self {
            format,
            networked,
            previous: String::new(),
            citations_sent: false,
        }
    }

    /// Answer observed so far
    #[must_use]
    pub fn answer(&self) -> &str {
        &self.previous
    }

    /// Decode one raw frame, writing any new text to `stream`
    ///
    /// Terminal events are left to the caller.
    pub fn decode(&mut self, raw: &str, stream: &EventStream) -> FrameEvent {
        let body = raw.trim_start_matches(|c: char| c.is_ascii_digit());
        let Ok(serde_json::Value::Array(parts)) = serde_json::from_str::<serde_json::Value>(body) else {
            return FrameEvent::Ignored;
        };
        let (Some(kind), Some(payload)) = (parts.first().and_then(|k| k.as_str()), parts.get(1)) else {
            return FrameEvent::Ignored;
        };

        let event = if kind == self.format.progress_type {
            FrameEvent::Progress
        } else if kind == self.format.answered_type {
            FrameEvent::Answered
        } else {
            return FrameEvent::Ignored;
        };

        // A final frame always completes the reply, even without a usable answer.
        let decoded = match payload.get("text").and_then(|t| t.as_str()) {
            Some(text) => serde_json::from_str::<AnswerPayload>(text).map_err(|e| e.to_string()),
            None => Err("missing text".to_string()),
        };
        let answer = match decoded {
            Ok(answer) => answer,
            Err(reason) if event == FrameEvent::Answered => {
                tracing::debug!(kind, error = %reason, "Undecodable final answer; completing with what was sent");
                AnswerPayload::default()
            }
            Err(reason) => {
                tracing::debug!(kind, error = %reason, "Undecodable answer payload");
                return FrameEvent::Ignored;
            }
        };

        if event == FrameEvent::Progress
            && self.networked
            && !self.citations_sent
            && self.previous.is_empty()
            && !answer.web_results.is_empty()
        {
            let links: Vec<String> = answer
                .web_results
                .iter()
                .map(|r| format!("- [{}]({})", r.name, r.url))
                .collect();
            stream.message(format!("{}\n\n", links.join("\n")));
            self.citations_sent = true;
        }

        let delta = self.advance(answer.answer);
        for piece in slice_chars(&delta, self.format.chunk_chars) {
            stream.message(piece);
        }
        event
    }

    /// Record a new cumulative answer and return the unseen suffix
    ///
    /// Answers no longer than the one already seen are ignored.
    fn advance(&mut self, answer: String) -> String {
        if answer.chars().count() <= self.previous.chars().count() {
            return String::new();
        }
        let delta = match answer.strip_prefix(self.previous.as_str()) {
            Some(suffix) => suffix.to_string(),
            None => answer.chars().skip(self.previous.chars().count()).collect(),
        };
        self.previous = answer;
        delta
    }
}

/// Split into pieces of at most `n` characters
#[must_use]
pub fn slice_chars(text: &str, n: usize) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    if n == 0 {
        return vec![text];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    for (count, (idx, _)) in text.char_indices().enumerate() {
        if count > 0 && count % n == 0 {
            pieces.push(&text[start..idx]);
            start = idx;
        }
    }
    pieces.push(&text[start..]);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::ChatEvent;
    use crate::test_utils::answer_frame;
    use pretty_assertions::assert_eq;

    fn messages(stream: &EventStream) -> Vec<String> {
        stream
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ChatEvent::Message { content } => Some(content),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_slice_chars() {
        assert_eq!(slice_chars("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(slice_chars("héllo", 2), vec!["hé", "ll", "o"]);
        assert!(slice_chars("", 3).is_empty());
    }

    #[test]
    fn test_emits_only_new_suffix() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), false);

        let first = answer_frame("query_progress", "Hi", &[]);
        let second = answer_frame("query_progress", "Hi there", &[]);
        assert_eq!(decoder.decode(&first, &stream), FrameEvent::Progress);
        assert_eq!(decoder.decode(&second, &stream), FrameEvent::Progress);

        assert_eq!(messages(&stream), vec!["Hi", " th", "ere"]);
        assert_eq!(decoder.answer(), "Hi there");
    }

    #[test]
    fn test_answered_frame_flushes_remaining_text() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), false);
        decoder.decode(&answer_frame("query_progress", "abc", &[]), &stream);
        let event = decoder.decode(&answer_frame("query_answered", "abcdef", &[]), &stream);
        assert_eq!(event, FrameEvent::Answered);
        assert_eq!(messages(&stream), vec!["abc", "def"]);
        assert!(!stream.is_terminated());
    }

    #[test]
    fn test_citations_once_for_networked_models() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), true);
        let sources = [("Rust", "https://rust-lang.org"), ("Docs", "https://docs.rs")];

        decoder.decode(&answer_frame("query_progress", "", &sources), &stream);
        decoder.decode(&answer_frame("query_progress", "Ok", &sources), &stream);

        assert_eq!(
            messages(&stream),
            vec![
                "- [Rust](https://rust-lang.org)\n- [Docs](https://docs.rs)\n\n",
                "Ok"
            ]
        );
    }

    #[test]
    fn test_no_citations_for_plain_models() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), false);
        decoder.decode(&answer_frame("query_progress", "", &[("a", "b")]), &stream);
        assert!(messages(&stream).is_empty());
    }

    #[test]
    fn test_ignores_unrelated_frames() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), false);
        assert_eq!(decoder.decode("3", &stream), FrameEvent::Ignored);
        assert_eq!(decoder.decode("40", &stream), FrameEvent::Ignored);
        assert_eq!(
            decoder.decode(r#"42["heartbeat",{}]"#, &stream),
            FrameEvent::Ignored
        );
        assert_eq!(
            decoder.decode(r#"42["query_progress",{"text":"nope"}]"#, &stream),
            FrameEvent::Ignored
        );
        assert!(stream.events().is_empty());
    }

    #[test]
    fn test_shorter_answer_does_not_repeat_text() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), false);
        decoder.decode(&answer_frame("query_progress", "Hello", &[]), &stream);
        decoder.decode(&answer_frame("query_progress", "", &[]), &stream);
        let event = decoder.decode(&answer_frame("query_answered", "Hello world", &[]), &stream);

        assert_eq!(event, FrameEvent::Answered);
        assert_eq!(messages(&stream).concat(), "Hello world");
        assert_eq!(decoder.answer(), "Hello world");
    }

    #[test]
    fn test_undecodable_final_frame_still_answers() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), false);
        decoder.decode(&answer_frame("query_progress", "Hi", &[]), &stream);

        let event = decoder.decode(r#"42["query_answered",{"text":"not json"}]"#, &stream);
        assert_eq!(event, FrameEvent::Answered);
        assert_eq!(decoder.decode(r#"42["query_answered",{}]"#, &stream), FrameEvent::Answered);
        assert_eq!(messages(&stream), vec!["Hi"]);
        assert_eq!(decoder.answer(), "Hi");
    }

    #[test]
    fn test_rewritten_answer_skips_by_length() {
        let stream = EventStream::new();
        let mut decoder = FrameDecoder::new(FrameFormat::default(), false);
        decoder.decode(&answer_frame("query_progress", "abc", &[]), &stream);
        decoder.decode(&answer_frame("query_progress", "xyzdef", &[]), &stream);
        assert_eq!(messages(&stream), vec!["abc", "def"]);
    }
}
