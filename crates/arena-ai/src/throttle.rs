use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::content::{ContentConsumer, SegmentKind};

const DRAIN_TICK: Duration = Duration::from_millis(16);

/// Explicit lifecycle of one throttled emission session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingFirstContent,
    Streaming,
    Finalizing,
    Finished,
}

struct PendingSegment {
    kind: SegmentKind,
    chars: VecDeque<char>,
    announced: bool,
}

struct ThrottleState {
    phase: Phase,
    queue: VecDeque<PendingSegment>,
    pending_usage: Vec<(u64, u64)>,
    accepting: bool,
    credit: f64,
}

struct ThrottleShared {
    state: Mutex<ThrottleState>,
    done: Notify,
}

enum Emission {
    Start(SegmentKind),
    Content(SegmentKind, String),
    Usage(u64, u64),
}

/// Paces content through to an inner consumer at a fixed characters-per-second
/// rate so network bursts read as typing instead of jumps. Characters queue
/// per segment in arrival order; a segment that arrives mid-drain begins
/// draining only once the one before it is fully flushed, so segments never
/// interleave even when the wire interleaves them. `finalize` resolves after
/// the queue drains and the inner consumer's `finished` hook has run, which
/// happens exactly once per session. Pushes arriving after finalize was
/// requested are dropped.
///
/// Clones share the same session; hold one clone to await `finalize` while
/// another is attached to a `ContentStream`. Must be created inside a tokio
/// runtime.
#[derive(Clone)]
pub struct ThrottledConsumer {
    shared: Arc<ThrottleShared>,
}

impl ThrottledConsumer {
    pub fn new(chars_per_second: f64, inner: Box<dyn ContentConsumer>) -> Self {
        let shared = Arc::new(ThrottleShared {
            state: Mutex::new(ThrottleState {
                phase: Phase::AwaitingFirstContent,
                queue: VecDeque::new(),
                pending_usage: Vec::new(),
                accepting: true,
                credit: 0.0,
            }),
            done: Notify::new(),
        });

        tokio::spawn(drain_loop(
            Arc::clone(&shared),
            chars_per_second.max(1.0),
            inner,
        ));

        Self { shared }
    }

    /// Stops intake and lets the drain flush what is already queued. Safe to
    /// call more than once; only the first call matters.
    pub fn request_finalize(&self) {
        let mut state = self.shared.state.lock().expect("throttle state poisoned");
        state.accepting = false;
        if state.phase != Phase::Finished {
            state.phase = Phase::Finalizing;
        }
    }

    /// Resolves once the queue has fully drained and the inner consumer has
    /// been finished. The drain keeps running on its own, so this completes
    /// even when no further content arrives.
    pub async fn finalize(&self) {
        self.request_finalize();
        loop {
            let notified = self.shared.done.notified();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("throttle state poisoned")
            .phase
            == Phase::Finished
    }
}

impl ContentConsumer for ThrottledConsumer {
    fn segment_started(&mut self, kind: SegmentKind) {
        let mut state = self.shared.state.lock().expect("throttle state poisoned");
        if !state.accepting {
            return;
        }
        let needs_segment = state
            .queue
            .back()
            .map(|segment| segment.kind != kind)
            .unwrap_or(true);
        if needs_segment {
            state.queue.push_back(PendingSegment {
                kind,
                chars: VecDeque::new(),
                announced: false,
            });
        }
    }

    fn content(&mut self, kind: SegmentKind, delta: &str) {
        let mut state = self.shared.state.lock().expect("throttle state poisoned");
        if !state.accepting {
            debug!(target: "arena_ai::throttle", "dropping content pushed after finalize");
            return;
        }
        let needs_segment = state
            .queue
            .back()
            .map(|segment| segment.kind != kind)
            .unwrap_or(true);
        if needs_segment {
            state.queue.push_back(PendingSegment {
                kind,
                chars: VecDeque::new(),
                announced: false,
            });
        }
        if let Some(segment) = state.queue.back_mut() {
            segment.chars.extend(delta.chars());
        }
    }

    fn usage(&mut self, input: u64, output: u64) {
        let mut state = self.shared.state.lock().expect("throttle state poisoned");
        state.pending_usage.push((input, output));
    }

    fn finished(&mut self) {
        self.request_finalize();
    }
}

async fn drain_loop(
    shared: Arc<ThrottleShared>,
    chars_per_second: f64,
    mut inner: Box<dyn ContentConsumer>,
) {
    let mut interval = tokio::time::interval(DRAIN_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let mut emissions = Vec::new();
        let mut finished = false;
        {
            let mut state = shared.state.lock().expect("throttle state poisoned");

            for (input, output) in std::mem::take(&mut state.pending_usage) {
                emissions.push(Emission::Usage(input, output));
            }

            state.credit += chars_per_second * DRAIN_TICK.as_secs_f64();
            let mut budget = state.credit.floor() as usize;
            state.credit -= budget as f64;

            while budget > 0 {
                let draining_last = state.queue.len() == 1;
                let still_accepting = state.accepting;
                let Some(front) = state.queue.front_mut() else {
                    break;
                };

                if front.chars.is_empty() {
                    // The trailing segment may still receive coalesced
                    // content while intake is open; earlier ones are done.
                    if draining_last && still_accepting {
                        break;
                    }
                    state.queue.pop_front();
                    continue;
                }

                let was_announced = front.announced;
                if !front.announced {
                    front.announced = true;
                    emissions.push(Emission::Start(front.kind));
                }

                let take = budget.min(front.chars.len());
                let flushed: String = front.chars.drain(..take).collect();
                budget -= take;
                emissions.push(Emission::Content(front.kind, flushed));

                if !was_announced && state.phase == Phase::AwaitingFirstContent {
                    state.phase = Phase::Streaming;
                }
            }

            let queue_empty = state
                .queue
                .iter()
                .all(|segment| segment.chars.is_empty());
            if queue_empty {
                state.credit = 0.0;
                if state.phase == Phase::Finalizing {
                    state.queue.clear();
                    state.phase = Phase::Finished;
                    finished = true;
                }
            }
        }

        for emission in emissions {
            match emission {
                Emission::Start(kind) => inner.segment_started(kind),
                Emission::Content(kind, flushed) => inner.content(kind, &flushed),
                Emission::Usage(input, output) => inner.usage(input, output),
            }
        }

        if finished {
            inner.finished();
            shared.done.notify_waiters();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct RecordingConsumer {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingConsumer {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events lock").clone()
        }
    }

    impl ContentConsumer for RecordingConsumer {
        fn segment_started(&mut self, kind: SegmentKind) {
            self.events
                .lock()
                .expect("events lock")
                .push(format!("start:{kind:?}"));
        }

        fn content(&mut self, kind: SegmentKind, delta: &str) {
            self.events
                .lock()
                .expect("events lock")
                .push(format!("content:{kind:?}:{delta}"));
        }

        fn usage(&mut self, input: u64, output: u64) {
            self.events
                .lock()
                .expect("events lock")
                .push(format!("usage:{input}:{output}"));
        }

        fn finished(&mut self) {
            self.events
                .lock()
                .expect("events lock")
                .push("finished".to_string());
        }
    }

    fn joined_content(events: &[String], kind: &str) -> String {
        let prefix = format!("content:{kind}:");
        events
            .iter()
            .filter_map(|event| event.strip_prefix(&prefix))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn drains_all_queued_content_before_finalize_resolves() {
        let recorder = RecordingConsumer::default();
        let mut throttled = ThrottledConsumer::new(200.0, Box::new(recorder.clone()));

        throttled.content(SegmentKind::Text, "hello world");
        throttled.finalize().await;

        let events = recorder.events();
        assert_eq!(joined_content(&events, "Text"), "hello world");
        assert_eq!(events.last().map(String::as_str), Some("finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn segments_drain_in_arrival_order_without_interleaving() {
        let recorder = RecordingConsumer::default();
        let mut throttled = ThrottledConsumer::new(500.0, Box::new(recorder.clone()));

        // Interleaved arrival over the wire.
        throttled.content(SegmentKind::Thought, "abc");
        throttled.content(SegmentKind::Text, "123");
        throttled.content(SegmentKind::Thought, "def");
        throttled.finalize().await;

        let events = recorder.events();
        let starts: Vec<&str> = events
            .iter()
            .filter(|event| event.starts_with("start:"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            starts,
            vec!["start:Thought", "start:Text", "start:Thought"]
        );
        assert_eq!(joined_content(&events, "Thought"), "abcdef");
        assert_eq!(joined_content(&events, "Text"), "123");

        // No thought content may appear between the text start and text end.
        let text_start = events
            .iter()
            .position(|event| event == "start:Text")
            .expect("text start");
        let thought_restart = events
            .iter()
            .rposition(|event| event == "start:Thought")
            .expect("second thought start");
        assert!(text_start < thought_restart);
        assert!(events[text_start..thought_restart]
            .iter()
            .all(|event| !event.starts_with("content:Thought")));
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_after_finalize_request_are_dropped() {
        let recorder = RecordingConsumer::default();
        let mut throttled = ThrottledConsumer::new(200.0, Box::new(recorder.clone()));

        throttled.content(SegmentKind::Text, "kept");
        throttled.request_finalize();
        throttled.content(SegmentKind::Text, "dropped");
        throttled.finalize().await;

        let events = recorder.events();
        assert_eq!(joined_content(&events, "Text"), "kept");
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_runs_exactly_once_even_when_requested_twice() {
        let recorder = RecordingConsumer::default();
        let throttled = ThrottledConsumer::new(200.0, Box::new(recorder.clone()));

        throttled.finalize().await;
        throttled.finalize().await;

        let finish_count = recorder
            .events()
            .iter()
            .filter(|event| event.as_str() == "finished")
            .count();
        assert_eq!(finish_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn usage_reports_pass_through_while_draining() {
        let recorder = RecordingConsumer::default();
        let mut throttled = ThrottledConsumer::new(200.0, Box::new(recorder.clone()));

        throttled.content(SegmentKind::Text, "hi");
        throttled.usage(10, 5);
        throttled.finalize().await;

        assert!(recorder.events().iter().any(|event| event == "usage:10:5"));
    }
}
