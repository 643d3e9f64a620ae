//! Parley - two-party voice/video calling with text chat
//!
//! This crate implements the client side of a two-party call protocol:
//! a session state machine that sequences identification, offer/answer
//! exchange, ICE candidate trickling, and teardown through an untrusted
//! signaling relay, plus an ordered chat channel carried over the
//! established transport session.

pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod media;
pub mod presenter;
pub mod session;
pub mod signaling;
pub mod transport;

pub use error::{AppError, Result};
