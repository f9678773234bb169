use serde_json::Value;
use tracing::debug;

/// Incremental server-sent-events parser. Bytes arrive in arbitrary chunks;
/// `feed` buffers the trailing incomplete line and emits one parsed JSON
/// payload per complete `data: ` line. Malformed lines are dropped, never
/// raised: partial frames split across chunk boundaries look exactly like
/// malformed JSON until the rest arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<Value> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = parse_data_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Drains whatever is left in the buffer at end of stream. Providers
    /// normally terminate every frame with a newline; this covers the ones
    /// that do not.
    pub fn finish(&mut self) -> Vec<Value> {
        let line = std::mem::take(&mut self.buffer);
        parse_data_line(&line).into_iter().collect()
    }
}

fn parse_data_line(line: &str) -> Option<Value> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let data = trimmed.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(_) => {
            debug!(target: "arena_ai::sse", line = data, "dropping unparsable frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_all(parser: &mut SseParser, chunks: &[&str]) -> Vec<Value> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn parses_payloads_split_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        let events = feed_all(
            &mut parser,
            &[
                "data: {\"text\":\"hel",
                "lo\"}\ndata: {\"text\":\"world\"}\n",
            ],
        );
        assert_eq!(events, vec![json!({"text": "hello"}), json!({"text": "world"})]);
    }

    #[test]
    fn chunking_is_irrelevant_to_the_emitted_event_list() {
        let raw = "data: {\"a\":1}\ndata: [DONE]\ndata: {\"b\":2}\n";

        let mut whole = SseParser::new();
        let whole_events = feed_all(&mut whole, &[raw]);

        for split in 1..raw.len() {
            let mut parser = SseParser::new();
            let events = feed_all(&mut parser, &[&raw[..split], &raw[split..]]);
            assert_eq!(events, whole_events, "split at byte {split}");
        }
    }

    #[test]
    fn malformed_frames_are_dropped_silently() {
        let mut parser = SseParser::new();
        let events = parser.feed(
            "data: {\"valid\":true}\ndata: not json\ndata: {\"also\":\"valid\"}\n",
        );
        assert_eq!(
            events,
            vec![json!({"valid": true}), json!({"also": "valid"})]
        );
    }

    #[test]
    fn skips_done_sentinel_and_non_data_lines() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: ping\n: comment\ndata: [DONE]\ndata: {\"x\":1}\n\n");
        assert_eq!(events, vec![json!({"x": 1})]);
    }

    #[test]
    fn finish_flushes_an_unterminated_trailing_frame() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"tail\":true}").is_empty());
        assert_eq!(parser.finish(), vec![json!({"tail": true})]);
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: {\"x\":1}\r\ndata: {\"y\":2}\r\n");
        assert_eq!(events, vec![json!({"x": 1}), json!({"y": 2})]);
    }
}
