//! Datatype registry: experiment directories, sink tables, and buffer sizes.

use std::fmt;

/// The kind of measurement data held by an archive, derived from the
/// experiment directory of its URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Ndt,
    Sidestream,
    Traceroute,
    Disco,
    Invalid,
}

/// Env var selecting the larger NDT buffer when delta snapshots are omitted.
pub const NDT_OMIT_DELTAS_ENV: &str = "NDT_OMIT_DELTAS";

impl DataType {
    /// Maps an experiment directory to its datatype.
    pub fn from_experiment(experiment: &str) -> DataType {
        match experiment {
            "ndt" => DataType::Ndt,
            "sidestream" => DataType::Sidestream,
            "paris-traceroute" => DataType::Traceroute,
            "switch" => DataType::Disco,
            _ => DataType::Invalid,
        }
    }

    /// The sink table this datatype's rows land in.
    pub fn table(&self) -> &'static str {
        match self {
            DataType::Ndt => "ndt",
            DataType::Sidestream => "sidestream",
            DataType::Traceroute => "traceroute",
            DataType::Disco => "disco_test",
            DataType::Invalid => "invalid",
        }
    }

    /// Rows buffered per batch before a sink commit.
    ///
    /// NDT rows are large; when `NDT_OMIT_DELTAS` is set the delta snapshots
    /// are dropped and a larger batch is safe.
    pub fn buffer_size(&self) -> usize {
        match self {
            DataType::Ndt => {
                let omit = std::env::var(NDT_OMIT_DELTAS_ENV)
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false);
                if omit {
                    50
                } else {
                    10
                }
            }
            DataType::Sidestream => 100,
            DataType::Traceroute => 300,
            DataType::Disco => 100,
            DataType::Invalid => 0,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Ndt => "ndt",
            DataType::Sidestream => "sidestream",
            DataType::Traceroute => "traceroute",
            DataType::Disco => "disco",
            DataType::Invalid => "invalid",
        };
        f.write_str(s)
    }
}
