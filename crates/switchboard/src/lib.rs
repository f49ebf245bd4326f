//! Switchboard Service Library
//!
//! This library provides the core functionality for Switchboard - a
//! stateful WebSocket signaling server responsible for:
//!
//! - Room coordination: short shareable codes, optional passwords, a
//!   creator role assigned once
//! - Participant lifecycle with a disconnect grace window and rejoin
//!   recognition across reconnects
//! - Session resumption via opaque tokens backed by durable records
//! - Fire-and-forget relay of WebRTC negotiation messages (offer, answer,
//!   ICE) between named participants in a room
//! - Write-through persistence to Redis; the live cache stays
//!   authoritative for signaling correctness
//!
//! # Architecture
//!
//! An actor model hierarchy serializes all room mutation per room:
//!
//! ```text
//! RoomRegistryActor (singleton per instance)
//! ├── owns the live room map and room code allocation
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── owns participant state and grace timers
//!         └── relays signaling between its participants
//! ```
//!
//! The gateway runs one task pair per WebSocket: a read task dispatching
//! client messages into the actors, and a write task pumping server events
//! back to the socket.
//!
//! # Key Design Decisions
//!
//! - **One room per connection**: entering a new room detaches the old
//!   membership through the normal disconnect transition
//! - **Grace before removal**: a dropped transport marks the participant
//!   inactive; removal happens only when the cancellable grace timer fires
//! - **Best-effort durability**: store writes are spawned and logged on
//!   failure, never awaited on the signaling path
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes
//! - [`gateway`] - WebSocket endpoint and per-connection dispatch
//! - [`observability`] - Metrics, health endpoints and analytics events
//! - [`sessions`] - Session cache over the durable store
//! - [`store`] - Durable store trait and Redis implementation
//! - [`tasks`] - Background expiry sweeper

pub mod actors;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod sessions;
pub mod store;
pub mod tasks;
