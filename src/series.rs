use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Outcome of the most recent analysis attempt on a series.
///
/// A series stays [`AnalysisStatus::Pending`] until the first attempt;
/// every later attempt fully overwrites the status and the volume fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Ok,
    Timeout,
    RuntimeError,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::RuntimeError => "runtime_error",
        };
        f.write_str(label)
    }
}

/// One committed scan series owned by a patient.
///
/// Created only after its candidate passed validation and conversion.
/// The identifier and the storage locations are fixed at creation; the
/// volume fields and the status are rewritten by each analysis attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    pub description: String,
    pub acquired_at: NaiveDateTime,
    pub slice_count: u32,

    pub dicom_archive_path: PathBuf,
    pub volume_dir: PathBuf,
    /// The converted volume file, recorded at commit time. Analysis reads
    /// this path rather than rebuilding it from the current configuration.
    pub volume_path: PathBuf,
    pub preview_dir: PathBuf,

    pub whole_brain_volume: Option<f64>,
    pub left_volume: Option<f64>,
    pub right_volume: Option<f64>,

    pub status: AnalysisStatus,
}

impl Series {
    /// Left hippocampus volume as a fraction of the whole brain volume,
    /// rounded to 5 decimals. Absent until both operands are present.
    pub fn normalized_left_volume(&self) -> Option<f64> {
        normalized(self.left_volume, self.whole_brain_volume)
    }

    /// Right analog of [`Series::normalized_left_volume`].
    pub fn normalized_right_volume(&self) -> Option<f64> {
        normalized(self.right_volume, self.whole_brain_volume)
    }
}

fn normalized(volume: Option<f64>, whole: Option<f64>) -> Option<f64> {
    match (volume, whole) {
        (Some(v), Some(w)) => Some(round_to(v / w, 5)),
        _ => None,
    }
}

/// Round to the given number of decimal places, halves away from zero.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
