//! Wire protocol for the Switchboard signaling service.
//!
//! This crate defines the closed set of JSON messages exchanged between a
//! client and the service over one signaling connection. Messages are tagged
//! unions on a `type` field with camelCase payload fields, so both sides can
//! match exhaustively. Negotiation payloads (SDP, ICE) are carried as opaque
//! JSON values and never interpreted here.

#![warn(clippy::pedantic)]

pub mod client;
pub mod server;

pub use client::ClientMessage;
pub use server::{ParticipantSummary, RoomErrorCode, ServerEvent};
