//! Bounded-time orchestration of the analysis stage graph.
//!
//! The graph is fixed and statically typed: skull-strip (A) feeds both the
//! structure segmentation (B) and the whole-brain statistics (D), and the
//! segmentation feeds the left and right structure statistics (C1, C2).
//! C1, C2, and D have no ordering constraint among each other and run
//! concurrently once their single dependency is satisfied. One wall-clock
//! budget covers the whole run; there are no per-stage timeouts and no
//! on-demand cancellation.

use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::series::round_to;
use crate::toolchain::{
    AnalysisToolchain, LEFT_HIPPOCAMPUS, RIGHT_HIPPOCAMPUS, Segmentation, SkullStripped,
    ToolError, VolumeStats,
};

/// Default wall-clock budget for one analysis run.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(720);

/// Identity of one node of the stage graph, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    SkullStrip,
    Segment,
    LeftStats,
    RightStats,
    WholeBrainStats,
}

impl StageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::SkullStrip => "skull_strip",
            Self::Segment => "segment",
            Self::LeftStats => "left_stats",
            Self::RightStats => "right_stats",
            Self::WholeBrainStats => "whole_brain_stats",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A stage fault, naming the stage that raised it.
#[derive(Debug, Error)]
#[error("stage {stage} failed: {source}")]
pub struct StageError {
    pub stage: StageKind,
    #[source]
    pub source: ToolError,
}

/// Everything one analysis run needs: the input volume, the series' working
/// directory, the stage parameters, and the overall deadline.
#[derive(Debug, Clone)]
pub struct AnalysisPlan {
    pub input: PathBuf,
    pub workdir: PathBuf,
    pub bet_frac: f64,
    pub first_method: String,
    pub first_three_stage: bool,
    pub budget: Duration,
}

/// Volume measurements of a successful run, each rounded to 3 decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub whole_brain_volume: f64,
    pub left_volume: f64,
    pub right_volume: f64,
}

#[derive(Debug)]
pub enum AnalysisOutcome {
    Completed(Measurements),
    TimedOut,
    Failed(StageError),
}

/// Execute the stage graph under the plan's wall-clock budget.
///
/// Working artifacts in the series' volume directory are always cleaned up
/// afterwards: only the original input survives, plus the skull-stripped
/// and segmentation volumes when the run succeeded.
pub async fn run<T: AnalysisToolchain>(toolchain: &T, plan: &AnalysisPlan) -> AnalysisOutcome {
    let (outcome, keep) = match timeout(plan.budget, run_graph(toolchain, plan)).await {
        Err(_) => {
            warn!(budget_secs = plan.budget.as_secs(), "analysis exceeded its budget");
            (AnalysisOutcome::TimedOut, Vec::new())
        }
        Ok(Err(stage_error)) => {
            warn!(stage = stage_error.stage.label(), error = %stage_error.source, "analysis stage faulted");
            (AnalysisOutcome::Failed(stage_error), Vec::new())
        }
        Ok(Ok(run)) => {
            let keep = vec![run.brain.volume.clone(), run.segmentation.volume.clone()];
            let measurements = Measurements {
                whole_brain_volume: round_to(run.whole.volume, 3),
                left_volume: round_to(run.left.volume, 3),
                right_volume: round_to(run.right.volume, 3),
            };
            (AnalysisOutcome::Completed(measurements), keep)
        }
    };

    cleanup_workdir(&plan.workdir, &plan.input, &keep);
    outcome
}

struct GraphRun {
    brain: SkullStripped,
    segmentation: Segmentation,
    whole: VolumeStats,
    left: VolumeStats,
    right: VolumeStats,
}

async fn run_graph<T: AnalysisToolchain>(
    toolchain: &T,
    plan: &AnalysisPlan,
) -> Result<GraphRun, StageError> {
    let brain = stage(
        StageKind::SkullStrip,
        toolchain.skull_strip(&plan.input, &plan.workdir, plan.bet_frac),
    )
    .await?;

    // D needs only A's output; C1 and C2 need only B's. Both branches
    // proceed independently under the shared deadline.
    let whole_brain = stage(StageKind::WholeBrainStats, toolchain.total_stats(&brain.volume));
    let structures = async {
        let segmentation = stage(
            StageKind::Segment,
            toolchain.segment(
                &brain.volume,
                &plan.workdir,
                &plan.first_method,
                plan.first_three_stage,
            ),
        )
        .await?;

        let left = stage(
            StageKind::LeftStats,
            toolchain.label_stats(&segmentation.volume, LEFT_HIPPOCAMPUS),
        );
        let right = stage(
            StageKind::RightStats,
            toolchain.label_stats(&segmentation.volume, RIGHT_HIPPOCAMPUS),
        );
        let (left, right) = tokio::try_join!(left, right)?;

        Ok::<_, StageError>((segmentation, left, right))
    };

    let (whole, (segmentation, left, right)) = tokio::try_join!(whole_brain, structures)?;

    Ok(GraphRun {
        brain,
        segmentation,
        whole,
        left,
        right,
    })
}

async fn stage<T>(
    kind: StageKind,
    task: impl Future<Output = Result<T, ToolError>>,
) -> Result<T, StageError> {
    debug!(stage = kind.label(), "stage started");
    let result = task.await;
    debug!(stage = kind.label(), ok = result.is_ok(), "stage finished");
    result.map_err(|source| StageError { stage: kind, source })
}

/// Remove every working artifact except the original input and the paths in
/// `keep`. Cleanup failures are logged, never escalated.
fn cleanup_workdir(workdir: &Path, input: &Path, keep: &[PathBuf]) {
    let entries = match fs::read_dir(workdir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(workdir = %workdir.display(), %err, "could not list working directory");
            return;
        }
    };

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path == *input || keep.contains(&path) {
            continue;
        }
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(err) = removed {
            warn!(path = %path.display(), %err, "could not remove working artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::IntensityBand;
    use std::sync::Mutex;
    use tokio::time::{Instant, sleep};

    /// Toolchain double with virtual per-stage durations.
    struct MockToolchain {
        skull_strip_takes: Duration,
        segment_takes: Duration,
        stats_take: Duration,
        failing_stage: Option<StageKind>,
        started: Mutex<Vec<&'static str>>,
    }

    impl MockToolchain {
        fn instant() -> Self {
            Self {
                skull_strip_takes: Duration::ZERO,
                segment_takes: Duration::ZERO,
                stats_take: Duration::ZERO,
                failing_stage: None,
                started: Mutex::new(Vec::new()),
            }
        }

        fn fault() -> ToolError {
            ToolError::Failed {
                tool: "mock",
                exit_code: Some(1),
                stderr: "boom".into(),
            }
        }

        fn enter(&self, kind: StageKind) -> Result<(), ToolError> {
            self.started.lock().unwrap().push(kind.label());
            if self.failing_stage == Some(kind) {
                return Err(Self::fault());
            }
            Ok(())
        }
    }

    impl AnalysisToolchain for MockToolchain {
        async fn skull_strip(
            &self,
            _input: &Path,
            workdir: &Path,
            _frac: f64,
        ) -> Result<SkullStripped, ToolError> {
            sleep(self.skull_strip_takes).await;
            self.enter(StageKind::SkullStrip)?;
            Ok(SkullStripped {
                volume: workdir.join("brain.nii.gz"),
            })
        }

        async fn segment(
            &self,
            _brain: &Path,
            workdir: &Path,
            method: &str,
            _three_stage: bool,
        ) -> Result<Segmentation, ToolError> {
            sleep(self.segment_takes).await;
            self.enter(StageKind::Segment)?;
            Ok(Segmentation {
                volume: workdir.join(format!("first_all_{method}_firstseg.nii.gz")),
            })
        }

        async fn label_stats(
            &self,
            _segmentation: &Path,
            band: IntensityBand,
        ) -> Result<VolumeStats, ToolError> {
            sleep(self.stats_take).await;
            if band == LEFT_HIPPOCAMPUS {
                self.enter(StageKind::LeftStats)?;
                Ok(VolumeStats {
                    voxels: 3217,
                    volume: 4021.1256,
                })
            } else {
                self.enter(StageKind::RightStats)?;
                Ok(VolumeStats {
                    voxels: 3199,
                    volume: 3998.7773,
                })
            }
        }

        async fn total_stats(&self, _brain: &Path) -> Result<VolumeStats, ToolError> {
            sleep(self.stats_take).await;
            self.enter(StageKind::WholeBrainStats)?;
            Ok(VolumeStats {
                voxels: 352_580,
                volume: 1_404_392.52689,
            })
        }
    }

    fn plan(workdir: &Path, budget: Duration) -> AnalysisPlan {
        AnalysisPlan {
            input: workdir.join("original.nii.gz"),
            workdir: workdir.to_path_buf(),
            bet_frac: 0.8,
            first_method: "none".into(),
            first_three_stage: false,
            budget,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_success_yields_measurements_rounded_to_three_decimals() {
        let workdir = tempfile::tempdir().unwrap();
        let toolchain = MockToolchain::instant();

        let outcome = run(&toolchain, &plan(workdir.path(), DEFAULT_BUDGET)).await;

        match outcome {
            AnalysisOutcome::Completed(m) => {
                assert_eq!(m.whole_brain_volume, 1_404_392.527);
                assert_eq!(m.left_volume, 4021.126);
                assert_eq!(m.right_volume, 3998.777);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_the_budget_times_out_without_measurements() {
        let workdir = tempfile::tempdir().unwrap();
        let toolchain = MockToolchain {
            segment_takes: Duration::from_secs(10),
            ..MockToolchain::instant()
        };

        let outcome = run(&toolchain, &plan(workdir.path(), Duration::from_secs(5))).await;

        assert!(matches!(outcome, AnalysisOutcome::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn a_stage_fault_names_the_stage() {
        let workdir = tempfile::tempdir().unwrap();
        let toolchain = MockToolchain {
            failing_stage: Some(StageKind::Segment),
            ..MockToolchain::instant()
        };

        let outcome = run(&toolchain, &plan(workdir.path(), DEFAULT_BUDGET)).await;

        match outcome {
            AnalysisOutcome::Failed(err) => assert_eq!(err.stage, StageKind::Segment),
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn independent_stages_run_concurrently_after_their_dependency() {
        let workdir = tempfile::tempdir().unwrap();
        let toolchain = MockToolchain {
            skull_strip_takes: Duration::from_secs(1),
            segment_takes: Duration::from_secs(10),
            stats_take: Duration::from_secs(2),
            ..MockToolchain::instant()
        };

        let started_at = Instant::now();
        let outcome = run(&toolchain, &plan(workdir.path(), DEFAULT_BUDGET)).await;

        // Critical path: skull_strip (1s) + segment (10s) + label stats
        // (2s, left and right in parallel). whole_brain_stats overlaps the
        // segmentation branch entirely.
        assert!(matches!(outcome, AnalysisOutcome::Completed(_)));
        assert_eq!(started_at.elapsed(), Duration::from_secs(13));

        let started = toolchain.started.lock().unwrap();
        let position = |label| started.iter().position(|s| *s == label).unwrap();
        assert!(position("whole_brain_stats") < position("segment"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_keeps_provenance_outputs_only_on_success() {
        let workdir = tempfile::tempdir().unwrap();
        let dir = workdir.path();
        for name in [
            "original.nii.gz",
            "brain.nii.gz",
            "first_all_none_firstseg.nii.gz",
            "first-L_Hipp_corr.nii.gz",
            "scratch.mat",
        ] {
            fs::write(dir.join(name), b"x").unwrap();
        }

        let outcome = run(&MockToolchain::instant(), &plan(dir, DEFAULT_BUDGET)).await;
        assert!(matches!(outcome, AnalysisOutcome::Completed(_)));

        assert!(dir.join("original.nii.gz").is_file());
        assert!(dir.join("brain.nii.gz").is_file());
        assert!(dir.join("first_all_none_firstseg.nii.gz").is_file());
        assert!(!dir.join("first-L_Hipp_corr.nii.gz").exists());
        assert!(!dir.join("scratch.mat").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_after_timeout_keeps_only_the_input() {
        let workdir = tempfile::tempdir().unwrap();
        let dir = workdir.path();
        for name in ["original.nii.gz", "brain.nii.gz", "scratch.mat"] {
            fs::write(dir.join(name), b"x").unwrap();
        }

        let toolchain = MockToolchain {
            segment_takes: Duration::from_secs(10),
            ..MockToolchain::instant()
        };
        let outcome = run(&toolchain, &plan(dir, Duration::from_secs(5))).await;
        assert!(matches!(outcome, AnalysisOutcome::TimedOut));

        assert!(dir.join("original.nii.gz").is_file());
        assert!(!dir.join("brain.nii.gz").exists());
        assert!(!dir.join("scratch.mat").exists());
    }
}
