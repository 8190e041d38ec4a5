use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

use crate::frame::{FrameSource, NoFrames};

/// One hardware encoding pipeline on the SoC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Video(u32),
    Audio(u32),
}

impl Channel {
    pub fn is_video(&self) -> bool {
        matches!(self, Channel::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Channel::Audio(_))
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Video(index) => write!(f, "video:{}", index),
            Channel::Audio(index) => write!(f, "audio:{}", index),
        }
    }
}

/// Opaque driver handle for one opened encoder stream.
///
/// Handles are plain values; the router owns their lifetime and is the only
/// place that hands them back to the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EncoderHandle {
    channel: Channel,
    raw: u64,
}

impl EncoderHandle {
    pub fn new(channel: Channel, raw: u64) -> Self {
        Self { channel, raw }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }
}

/// Handles backing one profile: always a video stream, audio when the
/// profile has it enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderPair {
    pub video: EncoderHandle,
    pub audio: Option<EncoderHandle>,
}

/// Hardware-specific primitives for the encoder driver.
///
/// Implementations are not reentrant per channel. The router holds its table
/// lock across every call, which is why the methods take `&mut self`.
pub trait EncoderAdapter: Send {
    /// Open a stream on `channel`. Fails when the channel has no free slot
    /// or the driver refuses the request.
    fn request_stream(&mut self, channel: Channel) -> anyhow::Result<EncoderHandle>;

    /// Stop frame delivery for `handle`.
    fn cancel_stream(&mut self, handle: EncoderHandle);

    /// Free every driver resource behind `handle`. Called once, after
    /// `cancel_stream`.
    fn cleanup(&mut self, handle: EncoderHandle);

    /// Frame read path for opened handles. Asked once, when the router is
    /// built.
    fn frames(&self) -> Arc<dyn FrameSource> {
        Arc::new(NoFrames)
    }
}
