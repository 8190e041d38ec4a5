use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::adapter::EncoderHandle;

/// One encoded access unit as the driver delivers it.
///
/// Video is H.264 Annex-B (start-code delimited NAL units). Audio is raw
/// G.711 A-law samples.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Position in the stream, counting from 0 when the channel was opened.
    pub seq: u64,
    /// Capture time relative to the stream start.
    pub pts: Duration,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Read side of the encoder driver.
///
/// Frame reads run on the serving threads at frame rate, so this is kept
/// apart from [`crate::EncoderAdapter`] and never takes the router lock. A
/// shared stream is read by many consumers, each with its own position.
pub trait FrameSource: Send + Sync {
    /// Oldest buffered frame on `handle` that comes after `after`, or `None`
    /// when nothing newer has been produced yet. `after == None` asks for the
    /// most recent keyframe, the point a new consumer can start decoding.
    ///
    /// Fails once the handle has been cleaned up.
    fn read_frame(&self, handle: EncoderHandle, after: Option<u64>) -> anyhow::Result<Option<EncodedFrame>>;
}

/// Source for adapters without a data plane; never has a frame.
pub struct NoFrames;

impl FrameSource for NoFrames {
    fn read_frame(&self, _handle: EncoderHandle, _after: Option<u64>) -> anyhow::Result<Option<EncodedFrame>> {
        Ok(None)
    }
}

/// One consumer's cursor over a stream.
pub struct FrameReader {
    source: Arc<dyn FrameSource>,
    handle: EncoderHandle,
    last: Option<u64>,
    skipped: u64,
}

impl FrameReader {
    pub fn new(source: Arc<dyn FrameSource>, handle: EncoderHandle) -> Self {
        Self {
            source,
            handle,
            last: None,
            skipped: 0,
        }
    }

    pub fn handle(&self) -> EncoderHandle {
        self.handle
    }

    /// Frames lost because this reader fell behind the driver's buffer.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Start over from the next keyframe, e.g. when playback resumes.
    pub fn resync(&mut self) {
        self.last = None;
    }

    pub fn next_frame(&mut self) -> anyhow::Result<Option<EncodedFrame>> {
        let Some(frame) = self.source.read_frame(self.handle, self.last)? else {
            return Ok(None);
        };
        if let Some(last) = self.last {
            let gap = frame.seq.saturating_sub(last + 1);
            if gap > 0 {
                log::debug!("reader {:?}: fell behind, skipped {} frames", self.handle, gap);
                self.skipped += gap;
            }
        }
        self.last = Some(frame.seq);
        Ok(Some(frame))
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("handle", &self.handle)
            .field("last", &self.last)
            .finish()
    }
}
