use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use parley_task::SpawnedTask;
use tokio::sync::broadcast;

use crate::chunker::FrameChunker;
use crate::resampler::StreamResampler;
use crate::{AudioFrame, FrameResultStream, Result};

/// Configuration for the audio frame bus.
#[derive(Debug, Clone)]
pub struct FrameBusConfig {
    /// Sample rate every emitted frame is normalized to.
    pub sample_rate: u32,
    /// Channel count of emitted frames. Sources with a different channel
    /// count are downmixed to mono.
    pub num_channels: u32,
    /// Duration of each emitted frame in milliseconds.
    pub frame_duration_ms: u32,
    /// Target buffer capacity in milliseconds.
    pub capacity_ms: u32,
}

impl Default for FrameBusConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::INPUT_SAMPLE_RATE,
            num_channels: 1,
            frame_duration_ms: crate::FRAME_DURATION_MS,
            capacity_ms: 1500,
        }
    }
}

impl FrameBusConfig {
    fn channel_capacity(&self) -> usize {
        if self.frame_duration_ms == 0 {
            return 32;
        }
        ((self.capacity_ms / self.frame_duration_ms) as usize).max(8)
    }
}

/// A deferred, fan-out-capable stream of fixed-size PCM frames.
///
/// Readers may subscribe before any source exists; they simply wait until
/// one is attached. [`set_source`] wires a source in, normalizing sample
/// rate and frame size on the way through; [`detach_source`] stops pulling
/// (flushing the stateful resampler) without closing downstream readers, and
/// a new source can be attached afterwards.
///
/// [`set_source`]: FrameBus::set_source
/// [`detach_source`]: FrameBus::detach_source
pub struct FrameBus {
    config: FrameBusConfig,
    tx: broadcast::Sender<Result<AudioFrame>>,
    pump: Mutex<Option<SpawnedTask<()>>>,
    dropped_frames: Arc<AtomicU64>,
}

impl FrameBus {
    pub fn new(config: FrameBusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity());
        Self {
            config,
            tx,
            pump: Mutex::new(None),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &FrameBusConfig {
        &self.config
    }

    /// Total frames readers have lost to lag.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Subscribe a new reader. Readers only observe frames emitted after
    /// subscription; a reader that was dropped can be re-created at any time.
    pub fn subscribe(&self) -> FrameReader {
        FrameReader {
            rx: self.tx.subscribe(),
            dropped_frames: self.dropped_frames.clone(),
        }
    }

    /// Attach a source, replacing any current one.
    pub fn set_source(&self, source: FrameResultStream) {
        let previous = {
            let mut pump = self.pump.lock().expect("frame bus pump lock poisoned");
            pump.replace(self.spawn_pump(source))
        };
        if let Some(task) = previous {
            // The old pump flushes its resampler tail as it winds down.
            task.cancel();
        }
    }

    /// Stop pulling from the current source without closing readers.
    pub fn detach_source(&self) {
        let previous = self
            .pump
            .lock()
            .expect("frame bus pump lock poisoned")
            .take();
        if let Some(task) = previous {
            task.cancel();
        }
    }

    fn spawn_pump(&self, mut source: FrameResultStream) -> SpawnedTask<()> {
        let tx = self.tx.clone();
        let sample_rate = self.config.sample_rate;
        let num_channels = self.config.num_channels;
        let frame_ms = self.config.frame_duration_ms;

        SpawnedTask::spawn(move |token| async move {
            let mut resampler: Option<StreamResampler> = None;
            let mut chunker = FrameChunker::with_frame_ms(sample_rate, num_channels, frame_ms);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = source.next() => match item {
                        Some(Ok(mut frame)) => {
                            if frame.num_channels() != num_channels {
                                frame = frame.to_mono();
                            }
                            let samples: Vec<i16> = if frame.sample_rate() != sample_rate {
                                let needs_new = resampler
                                    .as_ref()
                                    .map(|r| r.from_rate() != frame.sample_rate())
                                    .unwrap_or(true);
                                if needs_new {
                                    match StreamResampler::new(frame.sample_rate(), sample_rate) {
                                        Ok(r) => resampler = Some(r),
                                        Err(e) => {
                                            tracing::error!(error = %e, "cannot resample source");
                                            let _ = tx.send(Err(e));
                                            break;
                                        }
                                    }
                                }
                                resampler
                                    .as_mut()
                                    .map(|r| r.push(frame.data()))
                                    .unwrap_or_default()
                            } else {
                                frame.data().to_vec()
                            };
                            for out in chunker.push(&samples) {
                                let _ = tx.send(Ok(out));
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "audio source failed");
                            let _ = tx.send(Err(e));
                            break;
                        }
                        None => break,
                    }
                }
            }

            // Drain stateful stages so detach loses no samples.
            if let Some(mut r) = resampler.take() {
                let tail = r.flush();
                for out in chunker.push(&tail) {
                    let _ = tx.send(Ok(out));
                }
            }
            if let Some(out) = chunker.flush() {
                let _ = tx.send(Ok(out));
            }
        })
    }
}

/// Reading half of the bus.
pub struct FrameReader {
    rx: broadcast::Receiver<Result<AudioFrame>>,
    dropped_frames: Arc<AtomicU64>,
}

impl FrameReader {
    /// Next frame (or terminal source error). `None` when the bus itself is
    /// gone. Frames lost to reader lag are counted and skipped.
    pub async fn recv(&mut self) -> Option<Result<AudioFrame>> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let total = self.dropped_frames.fetch_add(n, Ordering::Relaxed) + n;
                    if total % 50 < n {
                        tracing::warn!(total_dropped = total, "frame reader lagging, dropping frames");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt the reader into a plain frame stream, dropping error items.
    pub fn into_frame_stream(mut self) -> crate::FrameStream {
        Box::pin(async_stream::stream! {
            while let Some(item) = self.recv().await {
                if let Ok(frame) = item {
                    yield frame;
                }
            }
        })
    }
}
