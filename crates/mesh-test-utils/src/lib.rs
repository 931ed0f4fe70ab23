//! # Mesh Test Utilities
//!
//! Shared test utilities for the mesh signaling core.
//!
//! This crate provides mock implementations and fixtures for exercising
//! coordinators end to end without a real store or media stack.
//!
//! ## Modules
//!
//! - `mock_store` - In-memory signaling store with per-client disconnect
//! - `mock_transport` - Deterministic fake media transport and factory
//! - `fixtures` - Tracing setup, polling helpers and peer spawning
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     init_test_tracing();
//!     let store = MockStore::new();
//!
//!     let alice = TestPeer::spawn(&store, "alice");
//!     let bob = TestPeer::spawn(&store, "bob");
//!
//!     alice.handle.join(Some("r1".to_string()), true).await.unwrap();
//!     bob.handle.join(Some("r1".to_string()), false).await.unwrap();
//!
//!     // Run your assertions...
//! }
//! ```

pub mod fixtures;
pub mod mock_store;
pub mod mock_transport;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_store::*;
pub use mock_transport::*;
