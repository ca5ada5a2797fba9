//! Archive URI classification.
//!
//! Task archives are addressed by URIs of the form
//! `gs://<bucket>/<experiment>/<YYYY>/<MM>/<DD>/<YYYYMMDD>T<HHMMSS>Z-mlab<N>-<pod><NN>-<experiment>-<NNNN>.tgz`
//! (`.tar` and `.tar.gz` are also accepted). [`DataPath::validate`] breaks a
//! URI into its components and rejects anything that does not match, with an
//! error naming the first offending piece so operators can act on the log
//! line alone.

use std::sync::LazyLock;

use regex::Regex;

use crate::datatype::DataType;

const START: &str = r"^gs://(?P<prefix>.*)/(?P<exp>[^/]*)/";
const DATE_PATH: &str = r"(?P<datepath>\d{4}/[01]\d/[0123]\d)/";
const DATE_TIME: &str = r"(?P<packeddate>\d{4}[01]\d[0123]\d)T(?P<time>\d{6})Z";
const POD: &str = r"-(?P<host>mlab\d)-(?P<pod>[a-z]{3}\d[0-9t])-";
const EXP_NNNN: &str = r"(?P<expname>.*)-(?P<filenumber>\d{4})";
const SUFFIX: &str = r"(?P<suffix>\.tar|\.tar\.gz|\.tgz)$";

static TASK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "{START}{DATE_PATH}{DATE_TIME}{POD}{EXP_NNNN}{SUFFIX}"
    ))
    .expect("valid task pattern")
});
static START_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(START).expect("valid prefix pattern"));
static END_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(SUFFIX).expect("valid suffix pattern"));
static POD_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(POD).expect("valid pod pattern"));

/// Validation failure for a task archive URI, tagged by the first component
/// that failed to match.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path should begin with gs://<bucket>/<experiment>/: {0}")]
    Prefix(String),
    #[error("path should end in .tar, .tgz, or .tar.gz: {0}")]
    Suffix(String),
    #[error("path should contain -mlabN-podNN-: {0}")]
    Pod(String),
    #[error("date path does not match archive timestamp: {0}")]
    DateMismatch(String),
    #[error("invalid task path: {0}")]
    Invalid(String),
}

/// The components of a task archive URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPath {
    /// Bucket (and any leading path), e.g. `m-lab-sandbox`.
    pub prefix: String,
    /// Experiment directory, e.g. `ndt`. Determines the datatype.
    pub experiment: String,
    /// Slash-separated date, e.g. `2016/01/26`.
    pub date_path: String,
    /// Dense date from the timestamp, e.g. `20160126`.
    pub packed_date: String,
    /// `HHMMSS` portion of the timestamp.
    pub time: String,
    /// Host token, e.g. `mlab1`.
    pub host: String,
    /// Pod token, e.g. `prg01`.
    pub pod: String,
    /// Experiment name embedded in the file name (may differ from the
    /// directory for multi-datatype experiments).
    pub exp_name: String,
    /// Zero-padded sequence number, e.g. `0007`.
    pub file_number: String,
    /// Archive suffix including the dot, e.g. `.tgz`.
    pub suffix: String,
}

impl DataPath {
    /// Validates a task archive URI and breaks out its components.
    ///
    /// The error identifies the first failing component (prefix, suffix, pod
    /// token, date consistency) before falling back to a generic rejection.
    pub fn validate(path: &str) -> Result<DataPath, PathError> {
        let caps = match TASK_PATTERN.captures(path) {
            Some(caps) => caps,
            None => {
                if !START_PATTERN.is_match(path) {
                    return Err(PathError::Prefix(path.to_string()));
                }
                if !END_PATTERN.is_match(path) {
                    return Err(PathError::Suffix(path.to_string()));
                }
                if !POD_PATTERN.is_match(path) {
                    return Err(PathError::Pod(path.to_string()));
                }
                return Err(PathError::Invalid(path.to_string()));
            }
        };

        let dp = DataPath {
            prefix: caps["prefix"].to_string(),
            experiment: caps["exp"].to_string(),
            date_path: caps["datepath"].to_string(),
            packed_date: caps["packeddate"].to_string(),
            time: caps["time"].to_string(),
            host: caps["host"].to_string(),
            pod: caps["pod"].to_string(),
            exp_name: caps["expname"].to_string(),
            file_number: caps["filenumber"].to_string(),
            suffix: caps["suffix"].to_string(),
        };

        // The directory date and the timestamp must name the same day.
        if dp.date_path.replace('/', "") != dp.packed_date {
            return Err(PathError::DateMismatch(path.to_string()));
        }

        Ok(dp)
    }

    /// The datatype stored under this path, derived from the experiment
    /// directory. Unknown experiments map to [`DataType::Invalid`].
    pub fn data_type(&self) -> DataType {
        DataType::from_experiment(&self.experiment)
    }

    /// The archive's calendar date.
    pub fn date(&self) -> Option<chrono::NaiveDate> {
        chrono::NaiveDate::parse_from_str(&self.packed_date, "%Y%m%d").ok()
    }
}

/// Extracts the three-letter metro ("acc" from "...-mlab1-acc02-...") from a
/// task file name, or `None` if the name carries no pod token.
pub fn metro_name(raw_name: &str) -> Option<&str> {
    let m = POD_PATTERN.find(raw_name)?;
    // "-mlabN-" is 7 bytes; the metro is the next three.
    raw_name.get(m.start() + 7..m.start() + 10)
}
