//! # Switchboard Test Utilities
//!
//! Shared test utilities for the Switchboard signaling service.
//!
//! This crate provides in-memory fakes and a gateway test harness so actor,
//! session, and end-to-end signaling tests run without Redis or a real
//! WebSocket client.
//!
//! ## Modules
//!
//! - `memory_store` - In-memory durable store with failure injection
//! - `harness` - `TestHarness` / `TestClient` for driving the gateway
//!   dispatch layer against a live room registry
//! - `fixtures` - Pre-built store records for seeding tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sb_test_utils::TestHarness;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     let mut alice = harness.connect();
//!     let mut bob = harness.connect();
//!
//!     alice.start_session("Alice").await;
//!     let room_id = alice.create_room().await;
//!     bob.join_room(&room_id, "Bob").await;
//!
//!     // Alice hears about Bob through her event channel.
//!     let event = alice.recv().await;
//!
//!     harness.shutdown().await;
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod memory_store;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use memory_store::*;

// The service's own unit tests compile `switchboard` a second time (the
// lib-test target); this re-export lets them name the library build that
// these fakes implement traits against.
pub use switchboard;
