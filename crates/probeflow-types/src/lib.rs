//! Leaf types shared across the probeflow pipeline.
//!
//! Nothing in this crate performs I/O: archive path classification, the
//! datatype registry, the error taxonomy, and row accounting live here so
//! the engine, parsers, and CLI can agree on them without depending on
//! each other.

pub mod datatype;
pub mod error;
pub mod path;
pub mod stats;

pub use datatype::DataType;
pub use error::EtlError;
pub use path::{DataPath, PathError};
pub use stats::{ActiveStats, Stats};
