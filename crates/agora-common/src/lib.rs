//! # agora-common
//!
//! Wire models, signaling errors, and configuration shared by the Agora call
//! crates. No call logic lives here, only the contract both devices agree on.

pub mod config;
pub mod error;
pub mod models;
pub mod snowflake;

pub use error::{SignalingError, SignalingResult};
