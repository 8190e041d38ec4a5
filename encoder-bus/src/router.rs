use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Debug, Formatter},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::{
    adapter::{Channel, EncoderAdapter, EncoderHandle, EncoderPair},
    frame::{FrameReader, FrameSource},
};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown profile token {0:?}")]
    UnknownProfile(String),

    #[error("encoder {channel} unavailable for profile {token:?}: {reason}")]
    ResourceExhausted {
        token: String,
        channel: Channel,
        reason: String,
    },
}

/// Encoder channels backing one profile token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileBinding {
    pub video: u32,
    pub audio: Option<u32>,
}

impl ProfileBinding {
    pub fn video_only(video: u32) -> Self {
        Self { video, audio: None }
    }

    pub fn with_audio(video: u32, audio: u32) -> Self {
        Self {
            video,
            audio: Some(audio),
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio.is_some()
    }
}

/// Read-only snapshot of the live profiles: token -> refcount.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub streams: BTreeMap<String, usize>,
}

impl RouterStats {
    pub fn refcount(&self, token: &str) -> usize {
        self.streams.get(token).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

struct RouterEntry {
    handles: EncoderPair,
    refcount: usize,
}

struct RouterState {
    adapter: Box<dyn EncoderAdapter>,
    bindings: HashMap<String, ProfileBinding>,
    entries: HashMap<String, RouterEntry>,
}

impl RouterState {
    fn open_pair(&mut self, token: &str, binding: ProfileBinding) -> Result<EncoderPair, RouterError> {
        let video_channel = Channel::Video(binding.video);
        let video = self
            .adapter
            .request_stream(video_channel)
            .map_err(|e| exhausted(token, video_channel, e))?;

        let audio = match binding.audio {
            Some(index) => {
                let audio_channel = Channel::Audio(index);
                match self.adapter.request_stream(audio_channel) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        // the video half is already open
                        self.close_handle(video);
                        return Err(exhausted(token, audio_channel, e));
                    }
                }
            }
            None => None,
        };

        Ok(EncoderPair { video, audio })
    }

    fn close_pair(&mut self, handles: EncoderPair) {
        if let Some(audio) = handles.audio {
            self.close_handle(audio);
        }
        self.close_handle(handles.video);
    }

    fn close_handle(&mut self, handle: EncoderHandle) {
        self.adapter.cancel_stream(handle);
        self.adapter.cleanup(handle);
    }
}

fn exhausted(token: &str, channel: Channel, err: anyhow::Error) -> RouterError {
    log::warn!(
        "router: request_stream({}) for profile {:?} failed: {:#}",
        channel,
        token,
        err
    );
    RouterError::ResourceExhausted {
        token: token.to_string(),
        channel,
        reason: format!("{:#}", err),
    }
}

/// Hands out one shared encoder pair per profile token.
///
/// The whole table, the adapter included, sits behind a single mutex, so a
/// lookup followed by the adapter's request call is atomic: two concurrent
/// first acquires of the same token can never both reach the driver.
/// Cloning the router is cheap and every clone sees the same table.
#[derive(Clone)]
pub struct StreamRouter {
    inner: Arc<Mutex<RouterState>>,
    frames: Arc<dyn FrameSource>,
}

impl StreamRouter {
    pub fn new(adapter: impl EncoderAdapter + 'static) -> Self {
        let frames = adapter.frames();
        Self {
            inner: Arc::new(Mutex::new(RouterState {
                adapter: Box::new(adapter),
                bindings: HashMap::new(),
                entries: HashMap::new(),
            })),
            frames,
        }
    }

    pub fn with_profile(self, token: &str, binding: ProfileBinding) -> Self {
        self.bind_profile(token, binding);
        self
    }

    /// Register (or replace) the channels used for `token`. A live entry keeps
    /// the handles it was opened with until its last lease is gone.
    pub fn bind_profile(&self, token: &str, binding: ProfileBinding) {
        let mut state = self.inner.lock();
        state.bindings.insert(token.to_string(), binding);
    }

    /// Take a reference on the encoder pair for `token`, opening it on first
    /// use.
    pub fn acquire(&self, token: &str) -> Result<StreamLease, RouterError> {
        let mut state = self.inner.lock();

        if let Some(entry) = state.entries.get_mut(token) {
            entry.refcount += 1;
            log::debug!("router: {:?} refcount -> {}", token, entry.refcount);
            return Ok(StreamLease::new(self.clone(), token, entry.handles));
        }

        let binding = *state
            .bindings
            .get(token)
            .ok_or_else(|| RouterError::UnknownProfile(token.to_string()))?;
        let handles = state.open_pair(token, binding)?;
        state.entries.insert(
            token.to_string(),
            RouterEntry {
                handles,
                refcount: 1,
            },
        );
        log::info!(
            "router: opened encoders for {:?} (video {:?}, audio {:?})",
            token,
            handles.video,
            handles.audio
        );

        Ok(StreamLease::new(self.clone(), token, handles))
    }

    /// Drop one reference on `token`; the encoder pair is closed when the
    /// last reference goes away.
    ///
    /// Releasing a token that is not tracked is a caller bug. It is logged and
    /// otherwise ignored so it cannot take the media pipeline down.
    pub fn release(&self, token: &str) {
        let mut state = self.inner.lock();

        let remaining = match state.entries.get_mut(token) {
            Some(entry) => {
                entry.refcount -= 1;
                entry.refcount
            }
            None => {
                log::warn!("router: release of untracked profile {:?} ignored", token);
                return;
            }
        };

        if remaining > 0 {
            log::debug!("router: {:?} refcount -> {}", token, remaining);
            return;
        }

        if let Some(entry) = state.entries.remove(token) {
            state.close_pair(entry.handles);
            log::info!("router: closed encoders for {:?}", token);
        }
    }

    pub fn stats(&self) -> RouterStats {
        let state = self.inner.lock();
        RouterStats {
            streams: state
                .entries
                .iter()
                .map(|(token, entry)| (token.clone(), entry.refcount))
                .collect(),
        }
    }

    pub fn refcount(&self, token: &str) -> usize {
        self.inner
            .lock()
            .entries
            .get(token)
            .map(|entry| entry.refcount)
            .unwrap_or(0)
    }
}

/// One consumer's reference on a profile's encoder pair.
///
/// The handles stay valid for as long as the lease is alive. Dropping the
/// lease releases the reference exactly once.
#[must_use = "dropping a lease releases the encoder reference immediately"]
pub struct StreamLease {
    router: StreamRouter,
    token: String,
    handles: EncoderPair,
}

impl StreamLease {
    fn new(router: StreamRouter, token: &str, handles: EncoderPair) -> Self {
        Self {
            router,
            token: token.to_string(),
            handles,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn handles(&self) -> EncoderPair {
        self.handles
    }

    pub fn video(&self) -> EncoderHandle {
        self.handles.video
    }

    pub fn audio(&self) -> Option<EncoderHandle> {
        self.handles.audio
    }

    /// A new cursor over the video stream, starting at its latest keyframe.
    pub fn video_reader(&self) -> FrameReader {
        FrameReader::new(Arc::clone(&self.router.frames), self.handles.video)
    }

    pub fn audio_reader(&self) -> Option<FrameReader> {
        self.handles
            .audio
            .map(|audio| FrameReader::new(Arc::clone(&self.router.frames), audio))
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.router.release(&self.token);
    }
}

impl Debug for StreamLease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLease")
            .field("token", &self.token)
            .field("handles", &self.handles)
            .finish()
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod router_test;
