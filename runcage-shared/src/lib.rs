//! Types shared between the runcage supervisor and the jailer.
//!
//! Both halves of the binary agree on exactly two things: how failures are
//! classified and what the report on stdout looks like. Everything else is
//! private to one side.

pub mod errors;
pub mod report;

pub use errors::{RuncageError, RuncageResult};
pub use report::{Metrics, Report};
