//! Common utilities for proxy integration tests.

#![allow(dead_code)]

pub mod assertions;
pub mod generators;
pub mod harness;
pub mod mock_backend;

pub use assertions::*;
pub use generators::*;
pub use harness::*;
pub use mock_backend::*;
