//! Shared vocabulary for the opguard reliability substrate.
//!
//! Operation categories, per-call context, the audit record and sink interface,
//! and the error taxonomy every resilience layer raises.

pub mod audit;
pub mod category;
pub mod context;
pub mod error;

pub use audit::*;
pub use category::*;
pub use context::*;
pub use error::*;
