//! Structural and geometric validation of candidate series.
//!
//! Every check is pure and failure is per-series: a rejected candidate is
//! dropped from the current batch attempt while its siblings continue.

use std::collections::HashSet;
use thiserror::Error;

use crate::intake::CandidateSeries;

/// Fewer slices cannot form an expressive volume.
pub const MIN_SLICES: usize = 4;

const ORIENTATION_RTOL: f64 = 0.001;
const ORIENTATION_ATOL: f64 = 0.001;
const DIRECTION_RTOL: f64 = 0.05;
const DIRECTION_ATOL: f64 = 0.05;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("series \"{description}\" is already stored")]
    Duplicate { description: String },

    #[error("series \"{description}\" has {count} slices, at least {MIN_SLICES} are required")]
    TooFewSlices { description: String, count: usize },

    #[error(
        "series \"{description}\" instance numbers are not contiguous: \
         expected {expected} at position {position}, found {found}"
    )]
    NonContiguous {
        description: String,
        position: usize,
        expected: u32,
        found: u32,
    },

    #[error("series \"{description}\" has inconsistent orientation at instance {instance}")]
    InconsistentOrientation { description: String, instance: u32 },

    #[error("series \"{description}\" does not form a three-dimensional volume")]
    NotVolumetric { description: String },
}

/// Validate one candidate series against the identifiers already committed
/// for the owning patient. No side effects; the error carries a
/// human-readable reason.
pub fn validate(
    candidate: &CandidateSeries,
    registered_ids: &HashSet<String>,
) -> Result<(), ValidationError> {
    let description = || candidate.description.clone();

    if registered_ids.contains(&candidate.id) {
        return Err(ValidationError::Duplicate {
            description: description(),
        });
    }

    if candidate.slices.len() < MIN_SLICES {
        return Err(ValidationError::TooFewSlices {
            description: description(),
            count: candidate.slices.len(),
        });
    }

    check_contiguous(candidate)?;
    check_orientation(candidate)?;
    check_volumetric(candidate)
}

/// Instance numbers, sorted, must be exactly 1..n. The first position whose
/// expected number is absent is named.
fn check_contiguous(candidate: &CandidateSeries) -> Result<(), ValidationError> {
    let mut numbers: Vec<u32> = candidate.slices.iter().map(|s| s.instance_number).collect();
    numbers.sort_unstable();

    for (index, &found) in numbers.iter().enumerate() {
        let expected = index as u32 + 1;
        if found != expected {
            return Err(ValidationError::NonContiguous {
                description: candidate.description.clone(),
                position: index + 1,
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// Both orientation sub-vectors of every slice must match the first slice's
/// elementwise within the orientation tolerance.
fn check_orientation(candidate: &CandidateSeries) -> Result<(), ValidationError> {
    let first = &candidate.slices[0];
    let (first_row, first_column) = split_orientation(&first.orientation);

    for slice in &candidate.slices {
        let (row, column) = split_orientation(&slice.orientation);
        if !allclose(&row, &first_row, ORIENTATION_RTOL, ORIENTATION_ATOL)
            || !allclose(&column, &first_column, ORIENTATION_RTOL, ORIENTATION_ATOL)
        {
            return Err(ValidationError::InconsistentOrientation {
                description: candidate.description.clone(),
                instance: slice.instance_number,
            });
        }
    }
    Ok(())
}

/// A genuine volume advances along the slice normal: the normalized cross
/// product of the first slice's orientation sub-vectors must be parallel or
/// anti-parallel to the normalized first-to-last displacement. Co-planar or
/// non-advancing stacks fail here.
fn check_volumetric(candidate: &CandidateSeries) -> Result<(), ValidationError> {
    let not_volumetric = || ValidationError::NotVolumetric {
        description: candidate.description.clone(),
    };

    let first = &candidate.slices[0];
    let last = &candidate.slices[candidate.slices.len() - 1];

    let (row, column) = split_orientation(&first.orientation);
    let normal = normalize(cross(&row, &column)).ok_or_else(not_volumetric)?;
    let displacement = normalize(sub(&last.position, &first.position)).ok_or_else(not_volumetric)?;

    let parallel = allclose(&normal, &displacement, DIRECTION_RTOL, DIRECTION_ATOL)
        || allclose(&normal, &neg(&displacement), DIRECTION_RTOL, DIRECTION_ATOL);

    if parallel { Ok(()) } else { Err(not_volumetric()) }
}

fn split_orientation(orientation: &[f64; 6]) -> ([f64; 3], [f64; 3]) {
    (
        [orientation[0], orientation[1], orientation[2]],
        [orientation[3], orientation[4], orientation[5]],
    )
}

/// Elementwise `|a - b| <= atol + rtol * |b|`.
fn allclose<const N: usize>(a: &[f64; N], b: &[f64; N], rtol: f64, atol: f64) -> bool {
    a.iter()
        .zip(b)
        .all(|(x, y)| (x - y).abs() <= atol + rtol * y.abs())
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn neg(v: &[f64; 3]) -> [f64; 3] {
    [-v[0], -v[1], -v[2]]
}

fn normalize(v: [f64; 3]) -> Option<[f64; 3]> {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if norm == 0.0 {
        return None;
    }
    Some([v[0] / norm, v[1] / norm, v[2] / norm])
}
