//! Conversion of a validated, ordered slice set into a single NIfTI volume
//! plus a bounded set of grayscale preview images.
//!
//! A conversion failure is local to its series: partial output is deleted
//! and sibling series in the same batch are unaffected.

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom::pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use nifti::NiftiHeader;
use nifti::writer::WriterOptions;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::volume::Volume;

/// Upper bound on preview images per series.
pub const MAX_PREVIEWS: usize = 10;

#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("pixel data error: {0}")]
    PixelData(#[from] dicom::pixeldata::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("preview image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Assemble the ordered slice files into one volume and write it to
/// `volume_path` (the voxel spacing goes into the NIfTI header).
///
/// On failure the partially written output directory is removed before the
/// error is returned.
pub fn convert_series(slice_paths: &[PathBuf], volume_path: &Path) -> Result<Volume, ConverterError> {
    match build_and_write(slice_paths, volume_path) {
        Ok(volume) => Ok(volume),
        Err(err) => {
            if let Some(dir) = volume_path.parent() {
                let _ = fs::remove_dir_all(dir);
            }
            Err(err)
        }
    }
}

fn build_and_write(slice_paths: &[PathBuf], volume_path: &Path) -> Result<Volume, ConverterError> {
    if slice_paths.is_empty() {
        return Err(ConverterError::NoValidImages);
    }

    let objects: Vec<_> = slice_paths
        .iter()
        .map(|path| open_file(path))
        .collect::<Result<_, _>>()?;

    let images: Vec<_> = objects
        .iter()
        .map(decode_image)
        .collect::<Result<_, _>>()?;

    validate_dimensions(&images)?;

    let data = build_volume_array(&images);
    let spacing = get_spacing(&objects).ok_or(ConverterError::MissingSpacing)?;
    let volume = Volume::new(data, spacing);

    if let Some(dir) = volume_path.parent() {
        fs::create_dir_all(dir)?;
    }

    let header = NiftiHeader {
        pixdim: [1.0, spacing.0, spacing.1, spacing.2, 0.0, 0.0, 0.0, 0.0],
        ..NiftiHeader::default()
    };
    WriterOptions::new(volume_path)
        .reference_header(&header)
        .write_nifti(&volume.data)?;

    debug!(path = %volume_path.display(), dim = ?volume.dim(), "wrote volume");
    Ok(volume)
}

fn decode_image(
    object: &FileDicomObject<InMemDicomObject>,
) -> Result<Array2<u16>, ConverterError> {
    let pixel_data = object.decode_pixel_data()?;
    let options = ConvertOptions::new().with_voi_lut(VoiLutOption::First);
    let array = pixel_data.to_ndarray_with_options::<u16>(&options)?;
    Ok(array.slice_move(s![0, .., .., 0]))
}

fn validate_dimensions(images: &[Array2<u16>]) -> Result<(), ConverterError> {
    let first_dim = images[0].dim();
    if images.iter().any(|img| img.dim() != first_dim) {
        return Err(ConverterError::InconsistentDimensions);
    }
    Ok(())
}

fn build_volume_array(images: &[Array2<u16>]) -> Array3<u16> {
    let (height, width) = images[0].dim();
    let depth = images.len();
    let mut volume = Array3::<u16>::zeros((depth, height, width));

    for (i, image) in images.iter().enumerate() {
        volume.slice_mut(s![i, .., ..]).assign(image);
    }

    volume
}

fn get_spacing(objects: &[FileDicomObject<InMemDicomObject>]) -> Option<(f32, f32, f32)> {
    objects.iter().find_map(|object| object_spacing(object))
}

/// In-plane pixel spacing plus slice thickness, if the object carries both.
/// The pixel spacing tag holds untrusted input and may be short.
fn object_spacing(object: &InMemDicomObject) -> Option<(f32, f32, f32)> {
    let pixel_spacing = object
        .element(tags::PIXEL_SPACING)
        .ok()?
        .to_multi_float32()
        .ok()?;
    let row = *pixel_spacing.first()?;
    let column = *pixel_spacing.get(1)?;

    let slice_thickness = object
        .element(tags::SLICE_THICKNESS)
        .ok()?
        .to_float32()
        .ok()?;

    Some((row, column, slice_thickness))
}

/// Indices of at most [`MAX_PREVIEWS`] slices, evenly spaced across the
/// ordered set; every slice if there are fewer.
pub fn pick_preview_indices(slice_count: usize) -> Vec<usize> {
    if slice_count <= MAX_PREVIEWS {
        (0..slice_count).collect()
    } else {
        (0..MAX_PREVIEWS)
            .map(|i| i * (slice_count - 1) / (MAX_PREVIEWS - 1))
            .collect()
    }
}

/// Render the preview image set into `preview_dir`, one grayscale file per
/// selected slice, named by its instance number.
pub fn write_previews(
    volume: &Volume,
    instance_numbers: &[u32],
    preview_dir: &Path,
    ext: &str,
) -> Result<Vec<PathBuf>, ConverterError> {
    fs::create_dir_all(preview_dir)?;

    let count = instance_numbers.len().min(volume.dim().0);
    let mut written = Vec::new();

    for index in pick_preview_indices(count) {
        let Some(image) = volume.axial_image(index) else {
            continue;
        };
        let path = preview_dir.join(format!("{}{ext}", instance_numbers[index]));
        image.save(&path)?;
        written.push(path);
    }

    Ok(written)
}
