//! Shared types for the UPI escrow registrar.
//!
//! Everything here is plain data: identifiers, addresses, the cached mapping
//! record and the outcome of a remote write. Behaviour lives in `upi-registry`.

pub mod address;
pub mod mapping;
pub mod operation;
pub mod upi;

pub use address::*;
pub use mapping::*;
pub use operation::*;
pub use upi::*;
