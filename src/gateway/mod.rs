// =============================================================================
// Gateway Module
// =============================================================================
//
// The external WebSocket fan-out. Deliberately dumb: authenticate, enforce
// ACLs and per-connection limits, forward bus traffic with sequence numbers.
// No business logic lives here.

pub mod acl;
pub mod auth;
pub mod protocol;
pub mod ws;

pub use acl::Role;
pub use protocol::{ClientMessage, ErrorCode, ServerMessage};
pub use ws::Gateway;
