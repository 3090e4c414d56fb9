//! The scribefs wire protocol.
//!
//! One fixed-size record (see [`message::Message`]) is exchanged in both
//! directions on every connection. Traffic splits into two planes:
//!
//! - **Control plane**: the persistent client-to-NS session connection and
//!   the persistent NS-to-SS connection created by storage registration.
//!   Carries metadata commands, redirects and heartbeats.
//! - **Data plane**: one-shot client-to-SS connections carrying READ,
//!   WRITE (the sentence editing session), STREAM and UNDO.
//!
//! The [`wire`] module holds the codec; [`ops`] the opcode and status
//! vocabulary; [`message`] the record layout and framing helpers.

pub mod message;
pub mod ops;
pub mod wire;
