//! # Rowmirror Testkit
//!
//! Test utilities for rowmirror.
//!
//! This crate provides:
//! - Fixtures for seeded in-memory stores and fast session configs
//! - Property-based test generators using proptest
//! - Multi-session harnesses for convergence tests
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rowmirror_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn mirrors_a_row() {
//!     let fixture = StoreFixture::new().with_record("r1", json!({"a": 1}), Some(0));
//!     let (session, mirror) = fixture.start("r1").await;
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::init_test_logging;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static LOGGING: Once = Once::new();

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
