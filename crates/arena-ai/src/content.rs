use serde::{Deserialize, Serialize};

use crate::types::Part;
use crate::usage::TokenCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Text,
    Thought,
    Image,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub content: String,
    /// Opaque continuity token, populated only for thought segments.
    pub signature: Option<String>,
}

/// The environment-facing "consume emitted content" interface. The protocol
/// layer pushes structured events; whatever the caller attaches (UI timers,
/// typing animations, counters) stays on the caller's side.
pub trait ContentConsumer: Send {
    fn segment_started(&mut self, kind: SegmentKind);
    fn content(&mut self, kind: SegmentKind, delta: &str);
    fn usage(&mut self, input: u64, output: u64) {
        let _ = (input, output);
    }
    /// Called exactly once, after the final content of the call.
    fn finished(&mut self) {}
}

/// Append-only sequence of typed segments for one call. Consecutive pushes of
/// the same kind coalesce into the current segment; a kind switch always opens
/// a new segment, even when the previous one is still empty. Image pushes are
/// atomic and never coalesce. Owned exclusively by the call that created it.
pub struct ContentStream {
    segments: Vec<Segment>,
    consumer: Option<Box<dyn ContentConsumer>>,
}

impl ContentStream {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            consumer: None,
        }
    }

    pub fn with_consumer(consumer: Box<dyn ContentConsumer>) -> Self {
        Self {
            segments: Vec::new(),
            consumer: Some(consumer),
        }
    }

    pub fn push(&mut self, kind: SegmentKind, delta: &str) {
        let open_new = match self.segments.last() {
            Some(last) => last.kind != kind || kind == SegmentKind::Image,
            None => true,
        };

        if open_new {
            self.segments.push(Segment {
                kind,
                content: String::new(),
                signature: None,
            });
            if let Some(consumer) = &mut self.consumer {
                consumer.segment_started(kind);
            }
        }

        if delta.is_empty() {
            return;
        }
        if let Some(segment) = self.segments.last_mut() {
            segment.content.push_str(delta);
        }
        if let Some(consumer) = &mut self.consumer {
            consumer.content(kind, delta);
        }
    }

    pub fn push_text(&mut self, delta: &str) {
        self.push(SegmentKind::Text, delta);
    }

    pub fn push_thought(&mut self, delta: &str) {
        self.push(SegmentKind::Thought, delta);
    }

    pub fn push_image(&mut self, data_uri: &str) {
        self.push(SegmentKind::Image, data_uri);
    }

    /// Appends to the opaque signature of the current thought segment.
    /// Ignored when the stream is not inside a thought: a signature without a
    /// thought has nothing to attach to.
    pub fn append_thought_signature(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if let Some(segment) = self
            .segments
            .last_mut()
            .filter(|segment| segment.kind == SegmentKind::Thought)
        {
            segment
                .signature
                .get_or_insert_with(String::new)
                .push_str(delta);
        }
    }

    pub fn notify_usage(&mut self, counter: &TokenCounter) {
        if let Some(consumer) = &mut self.consumer {
            consumer.usage(counter.input, counter.output);
        }
    }

    pub fn finish(&mut self) {
        if let Some(consumer) = &mut self.consumer {
            consumer.finished();
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| segment.content.is_empty())
    }

    /// The normalized content-part array. Empty segments (opened by a kind
    /// switch that never received content) are dropped.
    pub fn into_parts(self) -> Vec<Part> {
        self.segments
            .into_iter()
            .filter(|segment| !segment.content.is_empty())
            .map(|segment| match segment.kind {
                SegmentKind::Text => Part::Text {
                    content: segment.content,
                },
                SegmentKind::Thought => Part::Thought {
                    content: segment.content,
                    thought_signature: segment.signature,
                },
                SegmentKind::Image => Part::Image {
                    content: segment.content,
                },
            })
            .collect()
    }
}

impl Default for ContentStream {
    fn default() -> Self {
        Self::new()
    }
}
