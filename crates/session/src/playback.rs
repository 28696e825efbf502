use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_audio::AudioFrame;
use parley_task::{Promise, SpawnedTask};
use parley_tts::{synchronized_prefix, TimedString};
use tokio::sync::Notify;

use crate::io::AudioOutput;

/// Reported once per segment, when its audio finished playing or was
/// dropped by an interruption.
#[derive(Debug, Clone, Default)]
pub struct PlaybackFinishedEvent {
    /// Seconds of audio the listener actually heard.
    pub playback_position: f64,
    pub interrupted: bool,
    /// Exact heard-text prefix, when the synthesizer provided word timings.
    pub synchronized_transcript: Option<String>,
}

/// Buffering audio sink between the reply pipeline and the transport.
///
/// The writer captures frames faster than realtime; an internal pump drains
/// them to the [`AudioOutput`] at wall-clock rate. Captured-vs-played
/// duration is tracked per segment so an interruption can report exactly how
/// much audio went out (played = pushed minus still-queued).
pub struct PlaybackSink {
    shared: Arc<SinkShared>,
    pump: SpawnedTask<()>,
}

struct SinkShared {
    output: Arc<dyn AudioOutput>,
    queue_size: Duration,
    state: Mutex<SinkState>,
    queue_wake: Notify,
    space_wake: Notify,
    stopped: AtomicBool,
}

struct SinkState {
    queue: VecDeque<SinkItem>,
    queued: Duration,
    /// Segment currently being captured.
    open: SegmentRecord,
    /// Flushed segments whose audio is still draining.
    in_flight: VecDeque<SegmentRecord>,
    /// Event from the most recent buffer clear, for the follow-up
    /// `wait_for_playout`.
    last_cleared: Option<PlaybackFinishedEvent>,
}

enum SinkItem {
    Frame { frame: AudioFrame, seq: u64 },
    EndOfSegment { seq: u64 },
}

struct SegmentRecord {
    seq: u64,
    played: Duration,
    timed: Vec<TimedString>,
    finished: Promise<PlaybackFinishedEvent>,
    has_audio: bool,
}

impl SegmentRecord {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            played: Duration::ZERO,
            timed: Vec::new(),
            finished: Promise::new(),
            has_audio: false,
        }
    }

    fn resolve_interrupted(self) -> PlaybackFinishedEvent {
        let position = self.played.as_secs_f64();
        let synchronized = if self.timed.is_empty() {
            None
        } else {
            Some(synchronized_prefix(&self.timed, position))
        };
        let event = PlaybackFinishedEvent {
            playback_position: position,
            interrupted: true,
            synchronized_transcript: synchronized,
        };
        self.finished.resolve(event.clone());
        event
    }
}

impl PlaybackSink {
    pub fn new(output: Arc<dyn AudioOutput>, queue_size: Duration) -> Self {
        let shared = Arc::new(SinkShared {
            output,
            queue_size,
            state: Mutex::new(SinkState {
                queue: VecDeque::new(),
                queued: Duration::ZERO,
                open: SegmentRecord::new(0),
                in_flight: VecDeque::new(),
                last_cleared: None,
            }),
            queue_wake: Notify::new(),
            space_wake: Notify::new(),
            stopped: AtomicBool::new(false),
        });
        let pump = Self::spawn_pump(shared.clone());
        Self { shared, pump }
    }

    /// Queue one frame for playout. Blocks only when the internal buffer
    /// would exceed its configured bound.
    pub async fn capture_frame(&self, frame: AudioFrame) {
        assert!(
            !self.shared.stopped.load(Ordering::SeqCst),
            "capture_frame on a stopped playback sink"
        );
        let duration = frame.duration();
        loop {
            let space = self.shared.space_wake.notified();
            {
                let mut st = self.shared.state.lock().expect("sink state lock poisoned");
                if st.queued + duration <= self.shared.queue_size {
                    let seq = st.open.seq;
                    st.queue.push_back(SinkItem::Frame { frame, seq });
                    st.queued += duration;
                    st.open.has_audio = true;
                    self.shared.queue_wake.notify_one();
                    return;
                }
            }
            space.await;
        }
    }

    /// Attach word timings for the open segment's transcript.
    pub fn push_timed_transcript(&self, words: &[TimedString]) {
        let mut st = self.shared.state.lock().expect("sink state lock poisoned");
        st.open.timed.extend_from_slice(words);
    }

    /// End the open segment. One `PlaybackFinishedEvent` resolves per flush
    /// once the segment's audio has fully drained.
    ///
    /// Flushing while a previous segment is still in flight is a caller
    /// error: the outstanding segment is cancelled — its remaining audio is
    /// dropped and its event resolves as interrupted at the played position.
    pub fn flush(&self) {
        let mut st = self.shared.state.lock().expect("sink state lock poisoned");
        if !st.in_flight.is_empty() {
            tracing::error!("flush called while a previous segment is still in flight, cancelling it");
            let cancelled: Vec<u64> = st.in_flight.iter().map(|record| record.seq).collect();
            let mut dropped = Duration::ZERO;
            st.queue.retain(|item| match item {
                SinkItem::Frame { frame, seq } if cancelled.contains(seq) => {
                    dropped += frame.duration();
                    false
                }
                SinkItem::EndOfSegment { seq } => !cancelled.contains(seq),
                _ => true,
            });
            st.queued = st.queued.saturating_sub(dropped);
            while let Some(record) = st.in_flight.pop_front() {
                record.resolve_interrupted();
            }
            self.shared.space_wake.notify_waiters();
        }
        let next = SegmentRecord::new(st.open.seq + 1);
        let seq = st.open.seq;
        let record = std::mem::replace(&mut st.open, next);
        st.in_flight.push_back(record);
        st.queue.push_back(SinkItem::EndOfSegment { seq });
        self.shared.queue_wake.notify_one();
    }

    /// Immediately drop all queued audio. Pending segments resolve as
    /// interrupted with the duration actually played.
    pub fn clear_buffer(&self) {
        let mut st = self.shared.state.lock().expect("sink state lock poisoned");
        st.queue.clear();
        st.queued = Duration::ZERO;
        let mut last = None;
        while let Some(record) = st.in_flight.pop_front() {
            last = Some(record.resolve_interrupted());
        }
        if st.open.has_audio {
            let next = SegmentRecord::new(st.open.seq + 1);
            let record = std::mem::replace(&mut st.open, next);
            last = Some(record.resolve_interrupted());
        }
        if last.is_some() {
            st.last_cleared = last;
        }
        self.shared.space_wake.notify_waiters();
    }

    /// Resolve the next finished segment.
    pub async fn wait_for_playout(&self) -> PlaybackFinishedEvent {
        let pending = {
            let mut st = self.shared.state.lock().expect("sink state lock poisoned");
            match st.in_flight.front() {
                Some(record) => Ok(record.finished.clone()),
                None => Err(st.last_cleared.take()),
            }
        };
        match pending {
            Ok(promise) => promise.wait().await,
            Err(Some(event)) => event,
            Err(None) => {
                tracing::debug!("wait_for_playout with no pending segment");
                PlaybackFinishedEvent::default()
            }
        }
    }

    /// Stop the pump. Capturing afterwards is a programming error.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.pump.cancel();
    }

    fn spawn_pump(shared: Arc<SinkShared>) -> SpawnedTask<()> {
        SpawnedTask::spawn(move |token| async move {
            loop {
                let item = {
                    let mut st = shared.state.lock().expect("sink state lock poisoned");
                    st.queue.pop_front()
                };
                let Some(item) = item else {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = shared.queue_wake.notified() => continue,
                    }
                };
                match item {
                    SinkItem::Frame { frame, seq } => {
                        let duration = frame.duration();
                        if let Err(e) = shared.output.write(frame).await {
                            tracing::warn!(error = %e, "audio output write failed");
                        }
                        // Pace the drain at wall-clock rate.
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(duration) => {}
                        }
                        let mut st = shared.state.lock().expect("sink state lock poisoned");
                        st.queued = st.queued.saturating_sub(duration);
                        // Attribute to the segment the frame belongs to; a
                        // cleared segment's frames are simply dropped.
                        if let Some(record) =
                            st.in_flight.iter_mut().find(|record| record.seq == seq)
                        {
                            record.played += duration;
                        } else if st.open.seq == seq {
                            st.open.played += duration;
                        }
                        drop(st);
                        shared.space_wake.notify_waiters();
                    }
                    SinkItem::EndOfSegment { seq } => {
                        let record = {
                            let mut st = shared.state.lock().expect("sink state lock poisoned");
                            match st.in_flight.front() {
                                Some(front) if front.seq == seq => st.in_flight.pop_front(),
                                _ => None,
                            }
                        };
                        if let Some(record) = record {
                            let event = PlaybackFinishedEvent {
                                playback_position: record.played.as_secs_f64(),
                                interrupted: false,
                                synchronized_transcript: None,
                            };
                            record.finished.resolve(event);
                        }
                    }
                }
            }
        })
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}
