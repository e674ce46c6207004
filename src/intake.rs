//! Slice intake: per-slice metadata extraction, grouping into candidate
//! series, and the two-phase staging area.
//!
//! Grouping and ordering decisions are derived solely from embedded DICOM
//! metadata; client filenames and upload order are never trusted. A slice
//! that fails any metadata requirement is excluded on its own, with a
//! reported reason, and never aborts the rest of the batch.

use chrono::NaiveDateTime;
use dicom::core::Tag;
use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::store;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("not a readable DICOM file: {0}")]
    Unreadable(#[from] dicom::object::ReadError),

    #[error("missing required tag \"{0}\"")]
    MissingTag(&'static str),

    #[error("tag \"{0}\" has a malformed value")]
    MalformedTag(&'static str),

    #[error("tag \"{tag}\" must have length {expected}, found {actual}")]
    WrongVectorLength {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unparsable series timestamp {0:?}")]
    BadTimestamp(String),

    #[error("a different slice with instance number {instance} is already staged")]
    ConflictingSlice { instance: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A slice excluded from a batch, with the reason for the caller to report.
#[derive(Debug)]
pub struct RejectedSlice {
    pub filename: String,
    pub reason: IntakeError,
}

/// Metadata required from every slice before it can join a candidate series.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceMeta {
    pub series_id: String,
    pub description: String,
    pub acquired_at: NaiveDateTime,
    pub instance_number: u32,
    pub orientation: [f64; 6],
    pub position: [f64; 3],
}

/// One slice of a candidate series, with its staged file location.
#[derive(Debug, Clone)]
pub struct CandidateSlice {
    pub instance_number: u32,
    pub orientation: [f64; 6],
    pub position: [f64; 3],
    pub path: PathBuf,
}

/// A pipeline-internal series candidate, discarded after commit or
/// rejection. Slices are ordered by instance number.
#[derive(Debug, Clone)]
pub struct CandidateSeries {
    pub id: String,
    pub description: String,
    pub acquired_at: NaiveDateTime,
    pub slices: Vec<CandidateSlice>,
}

impl CandidateSeries {
    pub fn slice_paths(&self) -> Vec<PathBuf> {
        self.slices.iter().map(|s| s.path.clone()).collect()
    }
}

/// Extract the required metadata from one DICOM slice file.
pub fn read_slice_meta(path: &Path) -> Result<SliceMeta, IntakeError> {
    let object = open_file(path)?;
    slice_meta_from_object(&object)
}

fn slice_meta_from_object(
    object: &FileDicomObject<InMemDicomObject>,
) -> Result<SliceMeta, IntakeError> {
    let series_id = element_str(object, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?;
    let description = element_str(object, tags::SERIES_DESCRIPTION, "SeriesDescription")?;
    let time = element_str(object, tags::SERIES_TIME, "SeriesTime")?;
    let date = element_str(object, tags::SERIES_DATE, "SeriesDate")?;

    let instance_number = object
        .element(tags::INSTANCE_NUMBER)
        .map_err(|_| IntakeError::MissingTag("InstanceNumber"))?
        .to_int::<u32>()
        .map_err(|_| IntakeError::MalformedTag("InstanceNumber"))?;

    let orientation = element_vector::<6>(
        object,
        tags::IMAGE_ORIENTATION_PATIENT,
        "ImageOrientationPatient",
    )?;
    let position = element_vector::<3>(object, tags::IMAGE_POSITION_PATIENT, "ImagePositionPatient")?;

    Ok(SliceMeta {
        series_id,
        description,
        acquired_at: parse_series_datetime(&date, &time)?,
        instance_number,
        orientation,
        position,
    })
}

fn element_str(
    object: &FileDicomObject<InMemDicomObject>,
    tag: Tag,
    name: &'static str,
) -> Result<String, IntakeError> {
    let value = object
        .element(tag)
        .map_err(|_| IntakeError::MissingTag(name))?
        .to_str()
        .map_err(|_| IntakeError::MalformedTag(name))?;
    // String values arrive padded to even length, UIDs with NULs.
    Ok(value
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_owned())
}

fn element_vector<const N: usize>(
    object: &FileDicomObject<InMemDicomObject>,
    tag: Tag,
    name: &'static str,
) -> Result<[f64; N], IntakeError> {
    let values = object
        .element(tag)
        .map_err(|_| IntakeError::MissingTag(name))?
        .to_multi_float64()
        .map_err(|_| IntakeError::MalformedTag(name))?;

    values
        .try_into()
        .map_err(|values: Vec<f64>| IntakeError::WrongVectorLength {
            tag: name,
            expected: N,
            actual: values.len(),
        })
}

/// Composite acquisition timestamp: date + time truncated to whole seconds.
pub(crate) fn parse_series_datetime(
    date: &str,
    time: &str,
) -> Result<NaiveDateTime, IntakeError> {
    let whole_seconds = time.split('.').next().unwrap_or(time);
    NaiveDateTime::parse_from_str(
        &format!("{date} {whole_seconds}"),
        "%Y%m%d %H%M%S",
    )
    .map_err(|_| IntakeError::BadTimestamp(format!("{date} {time}")))
}

/// Group parsed slices into candidate series by series identifier.
///
/// Description and acquisition timestamp come from the first slice of each
/// group; slices within a candidate are ordered by instance number.
pub fn classify(slices: Vec<(PathBuf, SliceMeta)>) -> Vec<CandidateSeries> {
    let mut groups: BTreeMap<String, CandidateSeries> = BTreeMap::new();

    for (path, meta) in slices {
        let candidate = groups
            .entry(meta.series_id.clone())
            .or_insert_with(|| CandidateSeries {
                id: meta.series_id.clone(),
                description: meta.description.clone(),
                acquired_at: meta.acquired_at,
                slices: Vec::new(),
            });
        candidate.slices.push(CandidateSlice {
            instance_number: meta.instance_number,
            orientation: meta.orientation,
            position: meta.position,
            path,
        });
    }

    let mut candidates: Vec<_> = groups.into_values().collect();
    for candidate in &mut candidates {
        candidate.slices.sort_by_key(|s| s.instance_number);
    }
    candidates
}

/// Filesystem staging area for two-phase intake.
///
/// Phase one files each accepted upload under
/// `<root>/<patient>/<content-addressed series name>/<instance number>.dcm`,
/// so several upload rounds can contribute to one series before commit and
/// re-staging the same slice is idempotent. Phase two reads the staged
/// series back as candidates.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn patient_dir(&self, patient_id: &str) -> PathBuf {
        self.root.join(patient_id)
    }

    /// Stage one uploaded slice. The untrusted filename is used only for
    /// error reporting; the staged location is derived from the embedded
    /// metadata. Re-staging identical content is idempotent; a different
    /// slice claiming an already staged instance number is a conflict.
    pub fn stage_slice(
        &self,
        patient_id: &str,
        bytes: &[u8],
    ) -> Result<SliceMeta, IntakeError> {
        let patient_dir = self.patient_dir(patient_id);
        fs::create_dir_all(&patient_dir)?;

        let incoming = patient_dir.join(".incoming.dcm");
        fs::write(&incoming, bytes)?;

        let meta = match read_slice_meta(&incoming) {
            Ok(meta) => meta,
            Err(err) => {
                let _ = fs::remove_file(&incoming);
                return Err(err);
            }
        };

        let series_dir = patient_dir.join(store::series_dirname(&meta.series_id));
        fs::create_dir_all(&series_dir)?;

        let target = series_dir.join(format!("{:05}.dcm", meta.instance_number));
        if target.is_file() && fs::read(&target)? != bytes {
            let _ = fs::remove_file(&incoming);
            return Err(IntakeError::ConflictingSlice {
                instance: meta.instance_number,
            });
        }
        fs::rename(&incoming, target)?;

        Ok(meta)
    }

    /// Staged series directories for a patient, in stable order.
    pub fn staged_series_dirs(&self, patient_id: &str) -> Result<Vec<PathBuf>, IntakeError> {
        let patient_dir = self.patient_dir(patient_id);
        if !patient_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut dirs: Vec<_> = fs::read_dir(&patient_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Read one staged series directory back into a candidate. Slices that
    /// can no longer be read are excluded individually and reported.
    pub fn read_candidate(
        series_dir: &Path,
    ) -> Result<(Option<CandidateSeries>, Vec<RejectedSlice>), IntakeError> {
        let mut slices = Vec::new();
        let mut rejected = Vec::new();

        let mut paths: Vec<_> = fs::read_dir(series_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match read_slice_meta(&path) {
                Ok(meta) => slices.push((path, meta)),
                Err(reason) => {
                    warn!(slice = %filename, %reason, "excluding staged slice");
                    rejected.push(RejectedSlice { filename, reason });
                }
            }
        }

        Ok((classify(slices).into_iter().next(), rejected))
    }

    /// Drop one staged series so a later re-upload starts clean.
    pub fn discard_series(&self, series_dir: &Path) -> Result<(), IntakeError> {
        if series_dir.exists() {
            fs::remove_dir_all(series_dir)?;
        }
        Ok(())
    }

    /// Remove a patient's staging directory once nothing is left in it.
    pub fn finish_patient(&self, patient_id: &str) -> Result<(), IntakeError> {
        let patient_dir = self.patient_dir(patient_id);
        if patient_dir.is_dir() && fs::read_dir(&patient_dir)?.next().is_none() {
            fs::remove_dir_all(&patient_dir)?;
        }
        Ok(())
    }
}

/// A minimal encodable slice carrying exactly the required tags.
#[cfg(test)]
pub(crate) fn synthetic_slice(series_id: &str, instance_number: u32, description: &str) -> Vec<u8> {
    use dicom::core::{DataElement, VR, dicom_value};
    use dicom::object::FileMetaTableBuilder;

    let z = format!("{}.0", instance_number.saturating_sub(1));
    let object = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series_id)),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, dicom_value!(Str, description)),
        DataElement::new(tags::SERIES_DATE, VR::DA, dicom_value!(Str, "20210314")),
        DataElement::new(tags::SERIES_TIME, VR::TM, dicom_value!(Str, "092653.497382")),
        DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            dicom_value!(Str, instance_number.to_string()),
        ),
        DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["1.0", "0.0", "0.0", "0.0", "1.0", "0.0"]),
        ),
        DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            dicom_value!(Strs, ["0.0", "0.0", z.as_str()]),
        ),
    ]);

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.4")
        .media_storage_sop_instance_uid(format!("{series_id}.{instance_number}"))
        .transfer_syntax("1.2.840.10008.1.2.1");

    let mut bytes = Vec::new();
    object
        .with_meta(meta)
        .expect("file meta")
        .write_all(&mut bytes)
        .expect("encodable object");
    bytes
}
