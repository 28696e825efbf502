use std::sync::Arc;

use uuid::Uuid;

use crate::io::{TextOutput, TextSegmentAttributes, TextWriter};

/// Forwards one reply's transcript text to the text transport.
///
/// Delta mode keeps a single writer open for the whole segment and streams
/// increments into it. Non-delta mode opens a fresh writer per chunk and
/// rewrites the accumulated text, for transports without delta support.
pub(crate) struct TranscriptForwarder {
    output: Option<Arc<dyn TextOutput>>,
    delta_mode: bool,
    attrs: TextSegmentAttributes,
    writer: Option<Box<dyn TextWriter>>,
    accumulated: String,
}

impl TranscriptForwarder {
    pub(crate) fn new(
        output: Option<Arc<dyn TextOutput>>,
        delta_mode: bool,
        track_id: Option<String>,
    ) -> Self {
        Self {
            output,
            delta_mode,
            attrs: TextSegmentAttributes {
                segment_id: format!("seg_{}", Uuid::new_v4().simple()),
                track_id,
            },
            writer: None,
            accumulated: String::new(),
        }
    }

    pub(crate) fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub(crate) async fn write(&mut self, chunk: &str) {
        self.accumulated.push_str(chunk);
        let Some(output) = &self.output else {
            return;
        };
        if self.delta_mode {
            if self.writer.is_none() {
                self.writer = Some(output.open(self.attrs.clone()).await);
            }
            if let Some(writer) = self.writer.as_mut() {
                writer.write(chunk).await;
            }
        } else {
            let mut writer = output.open(self.attrs.clone()).await;
            writer.write(&self.accumulated).await;
            writer.close(false).await;
        }
    }

    /// Close the segment, marking it final. Returns the full forwarded text.
    pub(crate) async fn finish(mut self) -> String {
        if let Some(output) = &self.output {
            if self.delta_mode {
                if let Some(writer) = self.writer.take() {
                    writer.close(true).await;
                }
            } else if !self.accumulated.is_empty() {
                let mut writer = output.open(self.attrs.clone()).await;
                writer.write(&self.accumulated).await;
                writer.close(true).await;
            }
        }
        self.accumulated
    }
}
