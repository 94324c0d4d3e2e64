//! Core types, constants and serial-number arithmetic.
//!
//! This module has no runtime dependencies and is shared by every layer.

mod constants;
mod error;
mod serial;

pub use constants::*;
pub use error::*;
pub use serial::*;
