//! External analysis toolchain collaborator.
//!
//! The orchestrator is written against [`AnalysisToolchain`]; the shipped
//! implementation shells out to the FSL tools (`bet`, `run_first_all`,
//! `fslstats`). Launch failures, non-zero exits, and unparsable output are
//! distinguished so the orchestrator can report which stage faulted.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: &'static str,
        source: std::io::Error,
    },

    #[error("{tool} exited with code {exit_code:?}: {stderr}")]
    Failed {
        tool: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("unparsable {tool} output: {output:?}")]
    Parse {
        tool: &'static str,
        output: String,
    },

    #[error("expected output {0:?} was not produced")]
    MissingOutput(PathBuf),
}

/// Output of the skull-strip stage: the brain-only volume.
#[derive(Debug, Clone)]
pub struct SkullStripped {
    pub volume: PathBuf,
}

/// Output of the segmentation stage: the labeled structure volume.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub volume: PathBuf,
}

/// Voxel count and volume in mm³ extracted by a statistics stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeStats {
    pub voxels: u64,
    pub volume: f64,
}

/// Intensity-label band selecting one structure within a segmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityBand {
    pub lower: f64,
    pub upper: f64,
}

/// FIRST labels the left hippocampus 17.
pub const LEFT_HIPPOCAMPUS: IntensityBand = IntensityBand {
    lower: 16.5,
    upper: 17.5,
};

/// FIRST labels the right hippocampus 53.
pub const RIGHT_HIPPOCAMPUS: IntensityBand = IntensityBand {
    lower: 52.5,
    upper: 53.5,
};

/// Contract of the external analysis toolchain.
///
/// Implementations receive a volumetric input path plus stage parameters
/// and return stage output paths or extracted statistics. Long-running
/// stages must be cancellation-safe: the orchestrator drops in-flight
/// stage futures when the wall-clock budget runs out.
#[allow(async_fn_in_trait)]
pub trait AnalysisToolchain {
    /// Remove non-brain tissue. `frac` is the fractional intensity
    /// threshold.
    async fn skull_strip(
        &self,
        input: &Path,
        workdir: &Path,
        frac: f64,
    ) -> Result<SkullStripped, ToolError>;

    /// Segment the left and right hippocampus out of a skull-stripped
    /// volume.
    async fn segment(
        &self,
        brain: &Path,
        workdir: &Path,
        method: &str,
        three_stage: bool,
    ) -> Result<Segmentation, ToolError>;

    /// Voxel count and volume within one structure's intensity-label band.
    async fn label_stats(
        &self,
        segmentation: &Path,
        band: IntensityBand,
    ) -> Result<VolumeStats, ToolError>;

    /// Total non-zero voxel count and volume.
    async fn total_stats(&self, brain: &Path) -> Result<VolumeStats, ToolError>;
}

/// FSL-backed toolchain. Requires `bet`, `run_first_all`, and `fslstats`
/// on the PATH.
#[derive(Debug, Clone, Copy, Default)]
pub struct FslToolchain;

impl FslToolchain {
    pub fn new() -> Self {
        Self
    }
}

impl AnalysisToolchain for FslToolchain {
    async fn skull_strip(
        &self,
        input: &Path,
        workdir: &Path,
        frac: f64,
    ) -> Result<SkullStripped, ToolError> {
        // bet appends the NIfTI extension to the output base name itself.
        let out_base = workdir.join("brain");
        let volume = workdir.join("brain.nii.gz");

        let mut command = Command::new("bet");
        command
            .arg(input)
            .arg(&out_base)
            .arg("-f")
            .arg(frac.to_string());
        run_tool("bet", &mut command).await?;

        if !volume.is_file() {
            return Err(ToolError::MissingOutput(volume));
        }
        Ok(SkullStripped { volume })
    }

    async fn segment(
        &self,
        brain: &Path,
        workdir: &Path,
        method: &str,
        three_stage: bool,
    ) -> Result<Segmentation, ToolError> {
        let prefix = workdir.join("first");
        let volume = workdir.join(format!("first_all_{method}_firstseg.nii.gz"));

        let mut command = Command::new("run_first_all");
        command
            .arg("-i")
            .arg(brain)
            .arg("-o")
            .arg(&prefix)
            .args(["-s", "L_Hipp,R_Hipp", "-m", method]);
        if three_stage {
            command.arg("-3");
        }
        run_tool("run_first_all", &mut command).await?;

        if !volume.is_file() {
            return Err(ToolError::MissingOutput(volume));
        }
        Ok(Segmentation { volume })
    }

    async fn label_stats(
        &self,
        segmentation: &Path,
        band: IntensityBand,
    ) -> Result<VolumeStats, ToolError> {
        let mut command = Command::new("fslstats");
        command
            .arg(segmentation)
            .arg("-l")
            .arg(band.lower.to_string())
            .arg("-u")
            .arg(band.upper.to_string())
            .arg("-V");
        let stdout = run_tool("fslstats", &mut command).await?;
        parse_stats("fslstats", &stdout)
    }

    async fn total_stats(&self, brain: &Path) -> Result<VolumeStats, ToolError> {
        let mut command = Command::new("fslstats");
        command.arg(brain).arg("-V");
        let stdout = run_tool("fslstats", &mut command).await?;
        parse_stats("fslstats", &stdout)
    }
}

async fn run_tool(tool: &'static str, command: &mut Command) -> Result<String, ToolError> {
    debug!(%tool, "running analysis tool");

    // The whole graph runs under one deadline; reap the child if the
    // orchestrator drops this future.
    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ToolError::Launch { tool, source })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// `fslstats ... -V` prints `<voxels> <volume_mm3>`.
fn parse_stats(tool: &'static str, stdout: &str) -> Result<VolumeStats, ToolError> {
    let mut parts = stdout.split_whitespace();
    let voxels = parts.next().and_then(|v| v.parse::<u64>().ok());
    let volume = parts.next().and_then(|v| v.parse::<f64>().ok());

    match (voxels, volume) {
        (Some(voxels), Some(volume)) => Ok(VolumeStats { voxels, volume }),
        _ => Err(ToolError::Parse {
            tool,
            output: stdout.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_voxel_count_and_volume() {
        let stats = parse_stats("fslstats", "352580 1404392.526890 \n").unwrap();
        assert_eq!(
            stats,
            VolumeStats {
                voxels: 352_580,
                volume: 1_404_392.52689
            }
        );
    }

    #[test]
    fn rejects_truncated_output() {
        assert!(matches!(
            parse_stats("fslstats", "352580"),
            Err(ToolError::Parse { .. })
        ));
        assert!(matches!(
            parse_stats("fslstats", ""),
            Err(ToolError::Parse { .. })
        ));
    }

    #[test]
    fn hippocampus_bands_bracket_the_first_labels() {
        assert!(LEFT_HIPPOCAMPUS.lower < 17.0 && 17.0 < LEFT_HIPPOCAMPUS.upper);
        assert!(RIGHT_HIPPOCAMPUS.lower < 53.0 && 53.0 < RIGHT_HIPPOCAMPUS.upper);
    }
}
