//! Persistence collaborator for patient-owned series records.
//!
//! Patient documents are stored as a set of discriminated projections so a
//! caller can fetch or update one sub-document without touching the rest.
//! The recognized projections are a closed enum, each variant carrying its
//! own schema; an unrecognized record kind is unrepresentable rather than a
//! runtime fault.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

use crate::series::Series;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationData {
    pub name: String,
    pub surname: String,
    pub birthday: NaiveDate,
    pub mobile_number: String,
}

impl RegistrationData {
    /// Whole years between the birthday and the given date.
    pub fn age(&self, today: NaiveDate) -> i64 {
        (today - self.birthday).num_days() / 365
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimaryData {
    pub height: Option<u32>,
    pub weight: Option<u32>,
    pub is_smoking: Option<bool>,
    pub complaints: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondaryBiomarkers {
    pub mmse: Option<u32>,
    pub moca: Option<u32>,
}

/// The series sub-document: all committed series of one patient, keyed by
/// the scan-assigned series identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesData {
    pub series: HashMap<String, Series>,
}

/// One patient sub-document, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatientProjection {
    Registration(RegistrationData),
    Primary(PrimaryData),
    Biomarkers(SecondaryBiomarkers),
    Series(SeriesData),
}

/// Selects which projection of a patient document to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionKind {
    Registration,
    Primary,
    Biomarkers,
    Series,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PatientDocument {
    registration: Option<RegistrationData>,
    primary: Option<PrimaryData>,
    biomarkers: Option<SecondaryBiomarkers>,
    #[serde(default)]
    series: SeriesData,
}

impl PatientDocument {
    fn fetch(&self, kind: ProjectionKind) -> Option<PatientProjection> {
        match kind {
            ProjectionKind::Registration => {
                self.registration.clone().map(PatientProjection::Registration)
            }
            ProjectionKind::Primary => self.primary.clone().map(PatientProjection::Primary),
            ProjectionKind::Biomarkers => {
                self.biomarkers.clone().map(PatientProjection::Biomarkers)
            }
            ProjectionKind::Series => Some(PatientProjection::Series(self.series.clone())),
        }
    }

    fn apply(&mut self, projection: PatientProjection) {
        match projection {
            PatientProjection::Registration(data) => self.registration = Some(data),
            PatientProjection::Primary(data) => self.primary = Some(data),
            PatientProjection::Biomarkers(data) => self.biomarkers = Some(data),
            PatientProjection::Series(data) => self.series = data,
        }
    }
}

/// Storage contract for series records, scoped by patient.
///
/// Every operation is atomic with respect to a single series record; the
/// pipeline never needs to update two series as one unit.
pub trait SeriesRegistry {
    fn find(&self, patient_id: &str, series_id: &str) -> Result<Option<Series>, RegistryError>;

    /// Identifiers of every series already committed for the patient.
    fn list_ids(&self, patient_id: &str) -> Result<HashSet<String>, RegistryError>;

    fn upsert(
        &self,
        patient_id: &str,
        series_id: &str,
        series: Series,
    ) -> Result<(), RegistryError>;

    /// Returns whether a record was present.
    fn remove(&self, patient_id: &str, series_id: &str) -> Result<bool, RegistryError>;
}

/// In-process registry backend, used in tests and by embedders that bring
/// their own persistence.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    patients: RwLock<HashMap<String, PatientDocument>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch(
        &self,
        patient_id: &str,
        kind: ProjectionKind,
    ) -> Result<Option<PatientProjection>, RegistryError> {
        let patients = self.patients.read().unwrap_or_else(PoisonError::into_inner);
        Ok(patients.get(patient_id).and_then(|doc| doc.fetch(kind)))
    }

    pub fn update(
        &self,
        patient_id: &str,
        projection: PatientProjection,
    ) -> Result<(), RegistryError> {
        let mut patients = self.patients.write().unwrap_or_else(PoisonError::into_inner);
        patients
            .entry(patient_id.to_owned())
            .or_default()
            .apply(projection);
        Ok(())
    }
}

impl SeriesRegistry for InMemoryRegistry {
    fn find(&self, patient_id: &str, series_id: &str) -> Result<Option<Series>, RegistryError> {
        let patients = self.patients.read().unwrap_or_else(PoisonError::into_inner);
        Ok(patients
            .get(patient_id)
            .and_then(|doc| doc.series.series.get(series_id))
            .cloned())
    }

    fn list_ids(&self, patient_id: &str) -> Result<HashSet<String>, RegistryError> {
        let patients = self.patients.read().unwrap_or_else(PoisonError::into_inner);
        Ok(patients
            .get(patient_id)
            .map(|doc| doc.series.series.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert(
        &self,
        patient_id: &str,
        series_id: &str,
        series: Series,
    ) -> Result<(), RegistryError> {
        let mut patients = self.patients.write().unwrap_or_else(PoisonError::into_inner);
        patients
            .entry(patient_id.to_owned())
            .or_default()
            .series
            .series
            .insert(series_id.to_owned(), series);
        Ok(())
    }

    fn remove(&self, patient_id: &str, series_id: &str) -> Result<bool, RegistryError> {
        let mut patients = self.patients.write().unwrap_or_else(PoisonError::into_inner);
        Ok(patients
            .get_mut(patient_id)
            .is_some_and(|doc| doc.series.series.remove(series_id).is_some()))
    }
}

/// File-backed registry for the CLI. The whole collection is one JSON
/// document; each operation loads, mutates, and atomically rewrites it
/// under a process-wide lock.
#[derive(Debug)]
pub struct JsonFileRegistry {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, PatientDocument>, RegistryError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, patients: &HashMap<String, PatientDocument>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a torn file behind.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(patients)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SeriesRegistry for JsonFileRegistry {
    fn find(&self, patient_id: &str, series_id: &str) -> Result<Option<Series>, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let patients = self.load()?;
        Ok(patients
            .get(patient_id)
            .and_then(|doc| doc.series.series.get(series_id))
            .cloned())
    }

    fn list_ids(&self, patient_id: &str) -> Result<HashSet<String>, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let patients = self.load()?;
        Ok(patients
            .get(patient_id)
            .map(|doc| doc.series.series.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert(
        &self,
        patient_id: &str,
        series_id: &str,
        series: Series,
    ) -> Result<(), RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut patients = self.load()?;
        patients
            .entry(patient_id.to_owned())
            .or_default()
            .series
            .series
            .insert(series_id.to_owned(), series);
        self.save(&patients)
    }

    fn remove(&self, patient_id: &str, series_id: &str) -> Result<bool, RegistryError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut patients = self.load()?;
        let removed = patients
            .get_mut(patient_id)
            .is_some_and(|doc| doc.series.series.remove(series_id).is_some());
        if removed {
            self.save(&patients)?;
        }
        Ok(removed)
    }
}
