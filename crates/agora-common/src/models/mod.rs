//! Wire models shared by both participants of a call.
//!
//! The `Call` row and the `IceCandidate` log are the only protocol between two
//! devices: everything the peers know about each other travels through them.

pub mod call;
pub mod ice;

pub use call::*;
pub use ice::*;
