//! Shared access to the camera's hardware encoder channels.
//!
//! Every RTSP session that wants frames for a profile goes through the
//! [`router::StreamRouter`]. The router opens one video (and optionally one
//! audio) encoder stream per profile token and hands out refcounted
//! [`router::StreamLease`]s, so any number of sessions can share a single
//! encoder pair without opening the channel twice. Frames are read through
//! the lease's [`frame::FrameReader`]s, outside the router lock.

pub mod adapter;
pub mod frame;
pub mod router;
pub mod sim;

pub use adapter::{Channel, EncoderAdapter, EncoderHandle, EncoderPair};
pub use frame::{EncodedFrame, FrameReader, FrameSource};
pub use router::{ProfileBinding, RouterError, RouterStats, StreamLease, StreamRouter};
