//! The end-to-end series pipeline: stage → classify → validate → store →
//! convert → commit, plus analysis and removal of committed series.
//!
//! Every candidate series flows through the pipeline independently; no
//! failure in one series aborts its siblings in the same batch. Each series
//! owns a disjoint, content-addressed set of directories, so candidates
//! need no cross-series locking.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::converter::{self, ConverterError};
use crate::intake::{CandidateSeries, IntakeError, RejectedSlice, StagingArea};
use crate::orchestrator::{self, AnalysisOutcome, AnalysisPlan};
use crate::registry::{RegistryError, SeriesRegistry};
use crate::series::{AnalysisStatus, Series};
use crate::store::{self, StoreError};
use crate::toolchain::AnalysisToolchain;
use crate::validator;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("conversion error: {0}")]
    Convert(#[from] ConverterError),

    #[error("series {0:?} is not registered")]
    UnknownSeries(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One uploaded slice blob. The filename is untrusted and used only in
/// reports.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What happened to one candidate series during commit.
#[derive(Debug)]
pub enum SeriesDisposition {
    Committed {
        series_id: String,
        description: String,
    },
    Rejected {
        description: String,
        reason: String,
    },
}

/// Per-batch outcome the caller can surface to a user.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub rejected_slices: Vec<RejectedSlice>,
    pub series: Vec<SeriesDisposition>,
}

pub struct Pipeline<R> {
    config: Config,
    registry: R,
    staging: StagingArea,
}

impl<R: SeriesRegistry> Pipeline<R> {
    pub fn new(config: Config, registry: R) -> Self {
        let staging = StagingArea::new(&config.tmp_dir);
        Self {
            config,
            registry,
            staging,
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Intake phase one: classify-and-stage. Each accepted slice is filed
    /// by its embedded metadata; a malformed slice is rejected on its own
    /// and the batch continues. May be called repeatedly, across several
    /// upload rounds, before [`Pipeline::commit_staged`].
    pub fn stage_batch(
        &self,
        patient_id: &str,
        uploads: &[Upload],
    ) -> Result<Vec<RejectedSlice>, PipelineError> {
        let mut rejected = Vec::new();

        for upload in uploads {
            match self.staging.stage_slice(patient_id, &upload.bytes) {
                Ok(meta) => info!(
                    slice = %upload.filename,
                    series = %meta.series_id,
                    instance = meta.instance_number,
                    "slice staged"
                ),
                Err(reason) => {
                    warn!(slice = %upload.filename, %reason, "rejecting uploaded slice");
                    rejected.push(RejectedSlice {
                        filename: upload.filename.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(rejected)
    }

    /// Intake phase two: validate-and-commit every staged candidate of the
    /// patient. Rejected candidates are dropped from this attempt (a
    /// re-upload retries); committed ones get a `pending` series record.
    /// A failure on one staged series never aborts its siblings.
    pub fn commit_staged(&self, patient_id: &str) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport::default();
        let registered = self.registry.list_ids(patient_id)?;

        for series_dir in self.staging.staged_series_dirs(patient_id)? {
            let (candidate, rejected) = match StagingArea::read_candidate(&series_dir) {
                Ok(read) => read,
                Err(reason) => {
                    warn!(dir = %series_dir.display(), %reason, "staged series is unreadable");
                    report.series.push(SeriesDisposition::Rejected {
                        description: dir_label(&series_dir),
                        reason: reason.to_string(),
                    });
                    continue;
                }
            };
            report.rejected_slices.extend(rejected);

            let Some(candidate) = candidate else {
                self.discard_staged(&series_dir);
                continue;
            };

            if let Err(reason) = validator::validate(&candidate, &registered) {
                warn!(series = %candidate.id, %reason, "rejecting candidate series");
                self.discard_staged(&series_dir);
                report.series.push(SeriesDisposition::Rejected {
                    description: candidate.description,
                    reason: reason.to_string(),
                });
                continue;
            }

            match self.commit_candidate(patient_id, &candidate) {
                Ok(series) => {
                    info!(series = %series.id, slices = series.slice_count, "series committed");
                    report.series.push(SeriesDisposition::Committed {
                        series_id: series.id,
                        description: series.description,
                    });
                }
                Err(reason) => {
                    warn!(series = %candidate.id, %reason, "series commit failed");
                    report.series.push(SeriesDisposition::Rejected {
                        description: candidate.description.clone(),
                        reason: reason.to_string(),
                    });
                }
            }

            self.discard_staged(&series_dir);
        }

        if let Err(err) = self.staging.finish_patient(patient_id) {
            warn!(patient = %patient_id, %err, "could not clean up the staging directory");
        }
        Ok(report)
    }

    /// Leftovers are retried by the next commit; cleanup never aborts the
    /// batch.
    fn discard_staged(&self, series_dir: &Path) {
        if let Err(err) = self.staging.discard_series(series_dir) {
            warn!(dir = %series_dir.display(), %err, "could not discard a staged series");
        }
    }

    fn commit_candidate(
        &self,
        patient_id: &str,
        candidate: &CandidateSeries,
    ) -> Result<Series, PipelineError> {
        let dirname = store::series_dirname(&candidate.id);

        let dicom_root = self.config.dicom_dir.join(patient_id);
        let series_dir = store::move_slices(&dicom_root, &candidate.id, &candidate.slice_paths())?;

        // Slice files keep their instance-number names across the move.
        let ordered: Vec<PathBuf> = candidate
            .slices
            .iter()
            .filter_map(|slice| slice.path.file_name())
            .map(|name| series_dir.join(name))
            .collect();

        let volume_dir = self.config.volume_dir.join(patient_id).join(&dirname);
        let volume_path = volume_dir.join(self.config.volume_filename());
        let volume = match converter::convert_series(&ordered, &volume_path) {
            Ok(volume) => volume,
            Err(err) => {
                // The converter already removed its partial output; drop the
                // un-archived slice directory too so a re-upload starts clean.
                let _ = fs::remove_dir_all(&series_dir);
                return Err(err.into());
            }
        };

        let preview_dir = self.config.preview_dir.join(patient_id).join(&dirname);
        let instance_numbers: Vec<u32> = candidate
            .slices
            .iter()
            .map(|slice| slice.instance_number)
            .collect();
        converter::write_previews(
            &volume,
            &instance_numbers,
            &preview_dir,
            &self.config.preview_ext,
        )?;

        let archive_path = store::archive_series(&series_dir)?;

        let series = Series {
            id: candidate.id.clone(),
            description: candidate.description.clone(),
            acquired_at: candidate.acquired_at,
            slice_count: candidate.slices.len() as u32,
            dicom_archive_path: archive_path,
            volume_dir,
            volume_path,
            preview_dir,
            whole_brain_volume: None,
            left_volume: None,
            right_volume: None,
            status: AnalysisStatus::Pending,
        };
        self.registry.upsert(patient_id, &series.id, series.clone())?;

        Ok(series)
    }

    /// Run the analysis stage graph on a committed series and persist the
    /// outcome. Each run is a fresh attempt: status and volumes are fully
    /// overwritten, nothing of an earlier attempt survives.
    ///
    /// Blocks until the run finishes or its budget expires; a caller
    /// needing a responsive interface should dispatch this on a worker and
    /// observe the series status afterwards.
    pub async fn analyze<T: AnalysisToolchain>(
        &self,
        toolchain: &T,
        patient_id: &str,
        series_id: &str,
    ) -> Result<Series, PipelineError> {
        let mut series = self
            .registry
            .find(patient_id, series_id)?
            .ok_or_else(|| PipelineError::UnknownSeries(series_id.to_owned()))?;

        let plan = AnalysisPlan {
            input: series.volume_path.clone(),
            workdir: series.volume_dir.clone(),
            bet_frac: self.config.bet_frac,
            first_method: self.config.first_method.clone(),
            first_three_stage: self.config.first_three_stage,
            budget: self.config.analysis_budget,
        };

        info!(series = %series.id, budget_secs = plan.budget.as_secs(), "starting analysis");

        match orchestrator::run(toolchain, &plan).await {
            AnalysisOutcome::Completed(m) => {
                series.status = AnalysisStatus::Ok;
                series.whole_brain_volume = Some(m.whole_brain_volume);
                series.left_volume = Some(m.left_volume);
                series.right_volume = Some(m.right_volume);
            }
            AnalysisOutcome::TimedOut => {
                series.status = AnalysisStatus::Timeout;
                series.whole_brain_volume = None;
                series.left_volume = None;
                series.right_volume = None;
            }
            AnalysisOutcome::Failed(_) => {
                series.status = AnalysisStatus::RuntimeError;
                series.whole_brain_volume = None;
                series.left_volume = None;
                series.right_volume = None;
            }
        }

        info!(series = %series.id, status = %series.status, "analysis finished");
        self.registry.upsert(patient_id, series_id, series.clone())?;
        Ok(series)
    }

    /// Destroy a series: the registry record first, then all owned storage
    /// (slice archive, volume directory, preview directory).
    pub fn remove(&self, patient_id: &str, series_id: &str) -> Result<(), PipelineError> {
        let series = self
            .registry
            .find(patient_id, series_id)?
            .ok_or_else(|| PipelineError::UnknownSeries(series_id.to_owned()))?;

        self.registry.remove(patient_id, series_id)?;

        if series.dicom_archive_path.is_file() {
            fs::remove_file(&series.dicom_archive_path)?;
        }
        if series.volume_dir.is_dir() {
            fs::remove_dir_all(&series.volume_dir)?;
        }
        if series.preview_dir.is_dir() {
            fs::remove_dir_all(&series.preview_dir)?;
        }

        info!(series = %series_id, "series removed");
        Ok(())
    }
}

fn dir_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::synthetic_slice;
    use crate::registry::InMemoryRegistry;
    use crate::toolchain::{
        IntensityBand, LEFT_HIPPOCAMPUS, Segmentation, SkullStripped, ToolError, VolumeStats,
    };
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    /// Toolchain double: succeeds instantly, or stalls past any budget.
    /// Records the input path the first stage received.
    struct FakeToolchain {
        stall: bool,
        seen_input: Mutex<Option<PathBuf>>,
    }

    impl FakeToolchain {
        fn instant() -> Self {
            Self {
                stall: false,
                seen_input: Mutex::new(None),
            }
        }

        fn stalling() -> Self {
            Self {
                stall: true,
                ..Self::instant()
            }
        }
    }

    impl AnalysisToolchain for FakeToolchain {
        async fn skull_strip(
            &self,
            input: &Path,
            workdir: &Path,
            _frac: f64,
        ) -> Result<SkullStripped, ToolError> {
            *self.seen_input.lock().unwrap() = Some(input.to_path_buf());
            if self.stall {
                sleep(Duration::from_secs(100_000)).await;
            }
            Ok(SkullStripped {
                volume: workdir.join("brain.nii.gz"),
            })
        }

        async fn segment(
            &self,
            _brain: &Path,
            workdir: &Path,
            _method: &str,
            _three_stage: bool,
        ) -> Result<Segmentation, ToolError> {
            Ok(Segmentation {
                volume: workdir.join("first_all_none_firstseg.nii.gz"),
            })
        }

        async fn label_stats(
            &self,
            _segmentation: &Path,
            band: IntensityBand,
        ) -> Result<VolumeStats, ToolError> {
            let volume = if band == LEFT_HIPPOCAMPUS {
                4021.1256
            } else {
                3998.7773
            };
            Ok(VolumeStats {
                voxels: 3200,
                volume,
            })
        }

        async fn total_stats(&self, _brain: &Path) -> Result<VolumeStats, ToolError> {
            Ok(VolumeStats {
                voxels: 352_580,
                volume: 1_404_392.52689,
            })
        }
    }

    fn pipeline_in(tmp: &TempDir) -> Pipeline<InMemoryRegistry> {
        let root = tmp.path();
        let config = Config {
            tmp_dir: root.join("tmp"),
            dicom_dir: root.join("dicom"),
            volume_dir: root.join("nifti"),
            preview_dir: root.join("previews"),
            analysis_budget: Duration::from_secs(720),
            ..Config::default()
        };
        Pipeline::new(config, InMemoryRegistry::new())
    }

    fn committed_series(pipeline: &Pipeline<InMemoryRegistry>, tmp: &TempDir) -> Series {
        let volume_dir = tmp.path().join("nifti").join("p1").join("abc");
        let preview_dir = tmp.path().join("previews").join("p1").join("abc");
        let archive = tmp.path().join("dicom").join("p1").join("abc.tgz");
        let volume_path = volume_dir.join("original.nii.gz");
        fs::create_dir_all(&volume_dir).unwrap();
        fs::create_dir_all(&preview_dir).unwrap();
        fs::create_dir_all(archive.parent().unwrap()).unwrap();
        fs::write(&volume_path, b"volume").unwrap();
        fs::write(preview_dir.join("1.png"), b"png").unwrap();
        fs::write(&archive, b"tgz").unwrap();

        let series = Series {
            id: "1.2.3".into(),
            description: "T1".into(),
            acquired_at: NaiveDate::from_ymd_opt(2021, 3, 14)
                .unwrap()
                .and_hms_opt(9, 26, 53)
                .unwrap(),
            slice_count: 4,
            dicom_archive_path: archive,
            volume_dir,
            volume_path,
            preview_dir,
            whole_brain_volume: None,
            left_volume: None,
            right_volume: None,
            status: AnalysisStatus::Pending,
        };
        pipeline
            .registry()
            .upsert("p1", &series.id, series.clone())
            .unwrap();
        series
    }

    #[tokio::test(start_paused = true)]
    async fn successful_analysis_sets_status_and_rounded_volumes() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(&tmp);
        committed_series(&pipeline, &tmp);

        let series = pipeline
            .analyze(&FakeToolchain::instant(), "p1", "1.2.3")
            .await
            .unwrap();

        assert_eq!(series.status, AnalysisStatus::Ok);
        assert_eq!(series.whole_brain_volume, Some(1_404_392.527));
        assert_eq!(series.left_volume, Some(4021.126));
        assert_eq!(series.right_volume, Some(3998.777));

        let persisted = pipeline.registry().find("p1", "1.2.3").unwrap().unwrap();
        assert_eq!(persisted, series);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_analysis_leaves_volumes_unset() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(&tmp);
        committed_series(&pipeline, &tmp);

        let series = pipeline
            .analyze(&FakeToolchain::stalling(), "p1", "1.2.3")
            .await
            .unwrap();

        assert_eq!(series.status, AnalysisStatus::Timeout);
        assert_eq!(series.whole_brain_volume, None);
        assert_eq!(series.left_volume, None);
        assert_eq!(series.right_volume, None);
    }

    #[tokio::test(start_paused = true)]
    async fn a_retry_after_timeout_fully_replaces_the_first_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(&tmp);
        committed_series(&pipeline, &tmp);

        let first = pipeline
            .analyze(&FakeToolchain::stalling(), "p1", "1.2.3")
            .await
            .unwrap();
        assert_eq!(first.status, AnalysisStatus::Timeout);

        let second = pipeline
            .analyze(&FakeToolchain::instant(), "p1", "1.2.3")
            .await
            .unwrap();
        assert_eq!(second.status, AnalysisStatus::Ok);
        assert_eq!(second.whole_brain_volume, Some(1_404_392.527));
        assert_eq!(second.normalized_left_volume(), Some(0.00286));
    }

    #[tokio::test]
    async fn analyzing_an_unknown_series_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(&tmp);

        let result = pipeline
            .analyze(&FakeToolchain::instant(), "p1", "missing")
            .await;

        assert!(matches!(result, Err(PipelineError::UnknownSeries(_))));
    }

    #[test]
    fn a_malformed_slice_is_rejected_alone_and_the_batch_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(&tmp);

        let mut uploads: Vec<Upload> = (1..=3)
            .map(|n| Upload {
                filename: format!("{n}.dcm"),
                bytes: synthetic_slice("1.2.3", n, "T1"),
            })
            .collect();
        uploads.push(Upload {
            filename: "junk.bin".into(),
            bytes: b"not a dicom file".to_vec(),
        });

        let rejected = pipeline.stage_batch("p1", &uploads).unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].filename, "junk.bin");

        // The three parsable slices were staged and reach validation.
        let report = pipeline.commit_staged("p1").unwrap();
        assert!(matches!(
            &report.series[..],
            [SeriesDisposition::Rejected { reason, .. }] if reason.contains("has 3 slices")
        ));
    }

    #[cfg(unix)]
    #[test]
    fn a_failing_staged_directory_does_not_abort_its_siblings() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(&tmp);

        let uploads: Vec<Upload> = (1..=2)
            .map(|n| Upload {
                filename: format!("{n}.dcm"),
                bytes: synthetic_slice("1.2.3", n, "T1"),
            })
            .collect();
        assert!(pipeline.stage_batch("p1", &uploads).unwrap().is_empty());

        let broken = tmp.path().join("tmp").join("p1").join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::set_permissions(&broken, fs::Permissions::from_mode(0o000)).unwrap();
        let denied = fs::read_dir(&broken).is_err();

        let report = pipeline.commit_staged("p1").unwrap();
        let _ = fs::set_permissions(&broken, fs::Permissions::from_mode(0o755));

        // The parsable sibling still went through validation.
        assert!(report.series.iter().any(|d| matches!(
            d,
            SeriesDisposition::Rejected { reason, .. } if reason.contains("at least 4")
        )));
        // With directory permissions enforced, the unreadable staged series
        // is reported as its own rejection instead of failing the batch.
        if denied {
            assert_eq!(report.series.len(), 2);
        } else {
            assert_eq!(report.series.len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_reads_the_volume_path_recorded_at_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        // The configured extension changed after the series was committed.
        let config = Config {
            tmp_dir: root.join("tmp"),
            dicom_dir: root.join("dicom"),
            volume_dir: root.join("nifti"),
            preview_dir: root.join("previews"),
            volume_ext: ".nii".into(),
            ..Config::default()
        };
        let pipeline = Pipeline::new(config, InMemoryRegistry::new());
        let series = committed_series(&pipeline, &tmp);

        let toolchain = FakeToolchain::instant();
        pipeline.analyze(&toolchain, "p1", "1.2.3").await.unwrap();

        assert_eq!(
            toolchain.seen_input.lock().unwrap().clone(),
            Some(series.volume_path)
        );
    }

    #[test]
    fn remove_deletes_the_record_and_all_owned_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline_in(&tmp);
        let series = committed_series(&pipeline, &tmp);

        pipeline.remove("p1", "1.2.3").unwrap();

        assert!(pipeline.registry().find("p1", "1.2.3").unwrap().is_none());
        assert!(!series.dicom_archive_path.exists());
        assert!(!series.volume_dir.exists());
        assert!(!series.preview_dir.exists());

        assert!(matches!(
            pipeline.remove("p1", "1.2.3"),
            Err(PipelineError::UnknownSeries(_))
        ));
    }
}
