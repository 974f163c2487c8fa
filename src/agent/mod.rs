//! The two bridge agents.
//!
//! [`CaptureAgent`] sits with the discovering clients and tunnels their
//! broadcast queries out; [`ResponderAgent`] sits with the devices, replays
//! the queries locally, and tunnels the replies back.

mod capture;
mod responder;

pub use capture::CaptureAgent;
pub use responder::ResponderAgent;
