//! Transport-facing traits: where synthesized audio and transcript text
//! leave the runtime. Concrete transports (an SFU track, a local speaker, a
//! test capture) implement these.

use async_trait::async_trait;
use parley_audio::AudioFrame;

/// Outbound audio sink draining at wall-clock rate.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn write(&self, frame: AudioFrame) -> parley_audio::Result<()>;
}

/// Attributes identifying one transcript segment on the text transport.
#[derive(Debug, Clone)]
pub struct TextSegmentAttributes {
    pub segment_id: String,
    /// Audio track this transcript narrates, when known.
    pub track_id: Option<String>,
}

/// Outbound transcript text transport.
#[async_trait]
pub trait TextOutput: Send + Sync {
    async fn open(&self, attrs: TextSegmentAttributes) -> Box<dyn TextWriter>;
}

#[async_trait]
pub trait TextWriter: Send {
    async fn write(&mut self, chunk: &str);
    /// Close the writer; `is_final` marks the segment as complete.
    async fn close(self: Box<Self>, is_final: bool);
}
