//! # fanout-core
//!
//! Core primitives for the fanout array-task reconciler.
//!
//! This crate provides the building blocks shared by every fanout component:
//!
//! - **Compact Encodings**: Bit-packed arrays and bitsets sized to the fan-out
//!   width, serializable to a byte-exact binary form
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `fanout-core` performs no I/O. Anything that talks to a remote backend or a
//! host runtime lives in `fanout-batch`.
//!
//! ## Example
//!
//! ```rust
//! use fanout_core::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let mut phases = CompactArray::new(10_000, 4)?;
//! phases.set(42, 6)?;
//! assert_eq!(phases.get(42)?, 6);
//!
//! let mut cached = BitSet::new(10_000);
//! cached.set(42)?;
//! assert_eq!(cached.count_ones(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bitarray;
pub mod error;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bitarray::{BitSet, CompactArray, required_bit_width};
    pub use crate::error::{Error, Result};
}

pub use bitarray::{BitSet, CompactArray, required_bit_width};
pub use error::{Error, Result};
pub use observability::{LogFormat, init_logging};
