use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::{
    adapter::{Channel, EncoderAdapter, EncoderHandle},
    frame::{EncodedFrame, FrameSource},
};

/// 20 ms of 8 kHz A-law per audio frame.
pub const AUDIO_FRAME_RATE: u32 = 50;
pub const AUDIO_FRAME_BYTES: usize = 160;
/// Frames each stream keeps for late readers.
const BUFFERED_SECONDS: u64 = 2;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const SPS: [u8; 25] = [
    0x67, 0x42, 0xc0, 0x28, 0xd9, 0x00, 0x78, 0x02, 0x27, 0xe5, 0x84, 0x00, 0x00, 0x03, 0x00, 0x04,
    0x00, 0x00, 0x03, 0x00, 0xca, 0x3c, 0x60, 0xc9, 0x20,
];
const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];
const IDR_BYTES: usize = 6000;
const SLICE_BYTES: usize = 1200;

/// Software stand-in for the SoC encoder driver.
///
/// Each channel accepts at most `capacity` open streams at once; further
/// requests fail the way an exhausted hardware channel does. Open streams
/// produce synthetic frames in real time: H.264 with one IDR per second on
/// video channels, A-law silence on audio channels. Used by the server binary
/// when no vendor driver is linked, and by tests.
pub struct SimEncoder {
    capacity: usize,
    next_raw: u64,
    open: HashMap<Channel, usize>,
    live: HashSet<EncoderHandle>,
    cancelled: HashSet<EncoderHandle>,
    frames: Arc<SimFrames>,
}

impl SimEncoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_raw: 1,
            open: HashMap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            frames: Arc::new(SimFrames::new(25)),
        }
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frames = Arc::new(SimFrames::new(fps.max(1)));
        self
    }

    pub fn open_streams(&self, channel: Channel) -> usize {
        self.open.get(&channel).copied().unwrap_or(0)
    }

    pub fn live_handles(&self) -> usize {
        self.live.len()
    }
}

impl Default for SimEncoder {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Frame clock of the simulated driver. Frame `n` of a stream exists once
/// `n / fps` seconds have passed since the stream was opened.
pub struct SimFrames {
    video_fps: u32,
    started: Mutex<HashMap<EncoderHandle, Instant>>,
}

impl SimFrames {
    fn new(video_fps: u32) -> Self {
        Self {
            video_fps,
            started: Mutex::new(HashMap::new()),
        }
    }

    fn fps(&self, channel: Channel) -> u32 {
        match channel {
            Channel::Video(_) => self.video_fps,
            Channel::Audio(_) => AUDIO_FRAME_RATE,
        }
    }

    fn frame(&self, channel: Channel, seq: u64) -> EncodedFrame {
        let fps = u64::from(self.fps(channel));
        let pts = Duration::from_micros(seq * 1_000_000 / fps);
        match channel {
            Channel::Video(_) => {
                let keyframe = seq % fps == 0;
                EncodedFrame {
                    seq,
                    pts,
                    keyframe,
                    data: video_access_unit(seq, keyframe),
                }
            }
            Channel::Audio(_) => EncodedFrame {
                seq,
                pts,
                keyframe: true,
                // A-law silence
                data: Bytes::from(vec![0xd5; AUDIO_FRAME_BYTES]),
            },
        }
    }
}

impl FrameSource for SimFrames {
    fn read_frame(&self, handle: EncoderHandle, after: Option<u64>) -> anyhow::Result<Option<EncodedFrame>> {
        let started = self
            .started
            .lock()
            .get(&handle)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("stream {:?} is closed", handle))?;

        let channel = handle.channel();
        let fps = u64::from(self.fps(channel));
        let elapsed = started.elapsed().as_micros() as u64;
        // frames 0..produced exist
        let produced = elapsed * fps / 1_000_000 + 1;
        let oldest = produced.saturating_sub(fps * BUFFERED_SECONDS);

        let seq = match after {
            Some(last) if last + 1 >= produced => return Ok(None),
            Some(last) => (last + 1).max(oldest),
            None if channel.is_video() => (produced - 1) / fps * fps,
            None => produced - 1,
        };
        Ok(Some(self.frame(channel, seq)))
    }
}

fn video_access_unit(seq: u64, keyframe: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(IDR_BYTES + 64);
    if keyframe {
        buf.put_slice(&START_CODE);
        buf.put_slice(&SPS);
        buf.put_slice(&START_CODE);
        buf.put_slice(&PPS);
        buf.put_slice(&START_CODE);
        buf.put_u8(0x65);
        fill_slice(&mut buf, seq, IDR_BYTES);
    } else {
        buf.put_slice(&START_CODE);
        buf.put_u8(0x41);
        fill_slice(&mut buf, seq, SLICE_BYTES);
    }
    buf.freeze()
}

// never emits a zero byte, so no start code can appear inside the payload
fn fill_slice(buf: &mut BytesMut, seq: u64, len: usize) {
    for i in 0..len {
        buf.put_u8(0x80 | ((seq as usize + i) % 0x7f) as u8);
    }
}

impl EncoderAdapter for SimEncoder {
    fn request_stream(&mut self, channel: Channel) -> anyhow::Result<EncoderHandle> {
        let open = self.open.entry(channel).or_insert(0);
        if *open >= self.capacity {
            return Err(anyhow::anyhow!(
                "channel {} busy ({} of {} streams open)",
                channel,
                open,
                self.capacity
            ));
        }
        *open += 1;

        let handle = EncoderHandle::new(channel, self.next_raw);
        self.next_raw += 1;
        self.live.insert(handle);
        self.frames.started.lock().insert(handle, Instant::now());
        log::trace!("sim encoder: opened {:?}", handle);
        Ok(handle)
    }

    fn cancel_stream(&mut self, handle: EncoderHandle) {
        if self.live.contains(&handle) {
            self.cancelled.insert(handle);
        } else {
            log::warn!("sim encoder: cancel of unknown handle {:?}", handle);
        }
    }

    fn cleanup(&mut self, handle: EncoderHandle) {
        if !self.live.remove(&handle) {
            log::warn!("sim encoder: cleanup of unknown handle {:?}", handle);
            return;
        }
        self.cancelled.remove(&handle);
        self.frames.started.lock().remove(&handle);
        if let Some(open) = self.open.get_mut(&handle.channel()) {
            *open = open.saturating_sub(1);
        }
        log::trace!("sim encoder: closed {:?}", handle);
    }

    fn frames(&self) -> Arc<dyn FrameSource> {
        Arc::clone(&self.frames) as Arc<dyn FrameSource>
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_limits_open_streams() {
        let mut sim = SimEncoder::new(2);
        let a = sim.request_stream(Channel::Video(0)).unwrap();
        let _b = sim.request_stream(Channel::Video(0)).unwrap();
        assert!(sim.request_stream(Channel::Video(0)).is_err());

        // other channels are independent
        assert!(sim.request_stream(Channel::Audio(0)).is_ok());

        sim.cancel_stream(a);
        sim.cleanup(a);
        assert_eq!(sim.open_streams(Channel::Video(0)), 1);
        assert!(sim.request_stream(Channel::Video(0)).is_ok());
    }

    #[test]
    fn test_zero_capacity_always_fails() {
        let mut sim = SimEncoder::new(0);
        assert!(sim.request_stream(Channel::Video(1)).is_err());
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn test_new_reader_starts_on_keyframe() {
        let mut sim = SimEncoder::new(1).with_frame_rate(10);
        let video = sim.request_stream(Channel::Video(0)).unwrap();
        let frames = sim.frames();

        let first = frames.read_frame(video, None).unwrap().unwrap();
        assert_eq!(first.seq, 0);
        assert!(first.keyframe);
        assert_eq!(&first.data[..5], &[0, 0, 0, 1, 0x67]);
        assert!(frames.read_frame(video, Some(0)).unwrap().is_none());

        std::thread::sleep(Duration::from_millis(250));
        let next = frames.read_frame(video, Some(0)).unwrap().unwrap();
        assert_eq!(next.seq, 1);
        assert!(!next.keyframe);
        assert_eq!(next.pts, Duration::from_millis(100));
        assert_eq!(next.data[4], 0x41);
        assert!(!next.data[5..].contains(&0));
    }

    #[test]
    fn test_audio_frames_and_closed_stream() {
        let mut sim = SimEncoder::new(1);
        let audio = sim.request_stream(Channel::Audio(0)).unwrap();
        let frames = sim.frames();

        let frame = frames.read_frame(audio, None).unwrap().unwrap();
        assert_eq!(frame.data.len(), AUDIO_FRAME_BYTES);

        sim.cancel_stream(audio);
        sim.cleanup(audio);
        assert!(frames.read_frame(audio, None).is_err());
    }

    #[test]
    fn test_cleanup_unknown_handle_is_ignored() {
        let mut sim = SimEncoder::new(1);
        sim.cleanup(EncoderHandle::new(Channel::Video(0), 99));
        assert_eq!(sim.open_streams(Channel::Video(0)), 0);
    }
}
