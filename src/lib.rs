//! webcall - two-party WebRTC calls signaled through a shared document store
//!
//! The initiator publishes an SDP offer on a call document, the responder
//! answers on the same document, and both sides trickle ICE candidates
//! through per-role subcollections until the peer connection is up.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod store;
pub mod webrtc;

pub use error::{AppError, Result};
