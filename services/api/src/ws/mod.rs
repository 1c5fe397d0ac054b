//! WebSocket Examination Sessions
//!
//! One WebSocket connection hosts one examination. The module is split into:
//!
//! - `protocol`: the JSON message format between client and server.
//! - `relay`: a transcription source fed by the client's speech recogniser.
//! - `session`: the connection lifecycle, from handshake to report.
//! - `cycle`: turns examination commands into client messages and persistence.

mod cycle;
pub mod protocol;
pub mod relay;
pub mod session;

pub use session::ws_handler;
