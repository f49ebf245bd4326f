//! Actor model implementation for Switchboard.
//!
//! All room mutations are serialized through per-room actors:
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
//! # Key Design Decisions
//!
//! - **Per-room serialization**: Every mutation of a room's state flows
//!   through that room's mailbox; there is no global lock.
//! - **CancellationToken propagation**: The registry hands each room a
//!   child token for graceful shutdown.
//! - **No upward sends**: Room actors notify the registry only via an
//!   unbounded notice channel, so a full registry mailbox can never
//!   deadlock a room.
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton, live cache and durable fallback
//! - [`room`] - `RoomActor` per live room, participant lifecycle and relay
//! - [`messages`] - Message types for actor communication

pub mod messages;
pub mod registry;
pub mod room;

// Re-export primary types
pub use messages::*;
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle};
