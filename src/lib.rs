//! RTSP media core for a camera: a fixed worker pool serving client
//! connections, a per-connection session state machine and the encoder
//! sharing layer from `encoder-bus`.

pub mod api;
pub mod capability;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod rtsp;
pub mod server;
