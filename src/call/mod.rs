//! Two-party call signaling
//!
//! ```text
//!  initiator                      store                        responder
//!  create_call ── offer ──────▶ calls/{id} ◀────── get ─────── join_call
//!      ◀──── snapshot(answer) ── calls/{id} ◀──── answer ───────┘
//!  local ICE ──▶ offerCandidates ─────────────── added ──────▶ remote ICE
//!  remote ICE ◀── added ──────── answerCandidates ◀────────── local ICE
//! ```

mod coordinator;
mod session;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{invite_url, CallCoordinator, CoordinatorConfig};
pub use state::{CallState, Role};
