pub mod auth;
pub mod handler;
pub mod media;
pub mod ports;
pub mod registry;
pub mod request;
pub mod response;
pub mod rtp;
pub mod sdp;
pub mod session;
pub mod transport;

pub use auth::{AuthMode, Authenticator};
pub use handler::{RtspHandler, SessionSlot};
pub use ports::{PortAllocator, PortLease};
pub use registry::{SessionRegistry, SessionSummary};
pub use request::{Method, Request};
pub use response::{Response, StatusCode};
pub use session::{Session, SessionState};
pub use transport::{Delivery, TransportDescriptor};
