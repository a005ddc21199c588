//! The `locus_session` crate wraps the Locus engine for interactive use.
//!
//! Key components:
//! - **Ingest**: raw Model-Provider payload types, the `ModelProvider` seam,
//!   and normalization of untrusted schemas with documented defaults.
//! - **Session**: one exploration session; applies binding/resolution/
//!   visibility changes and recomputes the simulation on demand.
//! - **Export**: the delimited-text dataset format and its parser.

pub mod export;
pub mod ingest;
pub mod session;
