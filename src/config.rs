//! Environment-derived configuration with built-in defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestrator::DEFAULT_BUDGET;

#[derive(Debug, Clone)]
pub struct Config {
    /// Staging root for uploads awaiting commit.
    pub tmp_dir: PathBuf,
    /// Root for committed, archived DICOM series.
    pub dicom_dir: PathBuf,
    /// Root for converted volumetric files; also the analysis workdirs.
    pub volume_dir: PathBuf,
    /// Root for series preview images.
    pub preview_dir: PathBuf,

    pub volume_ext: String,
    pub preview_ext: String,

    /// Fractional intensity threshold for the skull-strip stage.
    pub bet_frac: f64,
    /// Boundary-correction method for the segmentation stage.
    pub first_method: String,
    /// Three-stage registration in the segmentation stage (two-stage
    /// otherwise).
    pub first_three_stage: bool,

    /// Wall-clock budget for one whole analysis run.
    pub analysis_budget: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmp_dir: "TMP".into(),
            dicom_dir: "DICOM_SERIES".into(),
            volume_dir: "NIFTI_SERIES".into(),
            preview_dir: "SERIES_IMAGE".into(),
            volume_ext: ".nii.gz".into(),
            preview_ext: ".png".into(),
            bet_frac: 0.8,
            first_method: "none".into(),
            first_three_stage: false,
            analysis_budget: DEFAULT_BUDGET,
        }
    }
}

impl Config {
    /// Build a configuration from the environment, falling back to the
    /// defaults for unset variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tmp_dir: env_or_path("TMP_FOLDER", defaults.tmp_dir),
            dicom_dir: env_or_path("DICOM_FOLDER", defaults.dicom_dir),
            volume_dir: env_or_path("NIFTI_FOLDER", defaults.volume_dir),
            preview_dir: env_or_path("SERIES_IMG_FOLDER", defaults.preview_dir),
            volume_ext: env_or("NIFTI_EXT", defaults.volume_ext),
            preview_ext: env_or("SERIES_IMG_EXT", defaults.preview_ext),
            bet_frac: env_parsed("BET_FRAC", defaults.bet_frac),
            first_method: env_or("FIRST_METHOD", defaults.first_method),
            first_three_stage: env::var("FIRST_THREE_STAGE")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.first_three_stage),
            analysis_budget: Duration::from_secs(env_parsed(
                "ANALYSIS_BUDGET_SECS",
                defaults.analysis_budget.as_secs(),
            )),
        }
    }

    /// File name of the converted volume, e.g. `original.nii.gz`.
    pub fn volume_filename(&self) -> String {
        format!("original{}", self.volume_ext)
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_or_path(key: &str, default: PathBuf) -> PathBuf {
    env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.bet_frac, 0.8);
        assert_eq!(config.first_method, "none");
        assert!(!config.first_three_stage);
        assert_eq!(config.analysis_budget, Duration::from_secs(720));
        assert_eq!(config.volume_filename(), "original.nii.gz");
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
        assert!(!parse_bool(""));
    }
}
