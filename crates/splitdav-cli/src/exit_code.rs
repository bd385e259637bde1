//! Exit codes for the proxy binary.

/// Clean shutdown after a signal.
pub const SUCCESS: u8 = 0;

/// Runtime failure (bind error, runtime setup, ...).
pub const GENERAL_ERROR: u8 = 1;

/// Invalid configuration.
pub const USAGE_ERROR: u8 = 2;
