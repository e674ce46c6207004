use image::{ImageBuffer, Luma};
use ndarray::{Array3, ArrayView2, s};
use rayon::prelude::*;

/// An assembled volumetric image: (depth, height, width) voxels plus the
/// in-plane pixel spacing and slice thickness in millimeters.
#[derive(Debug, Default)]
pub struct Volume {
    pub data: Array3<u16>,
    pub spacing: (f32, f32, f32),
}

impl Volume {
    pub fn new(data: Array3<u16>, spacing: (f32, f32, f32)) -> Self {
        Self { data, spacing }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    #[inline]
    fn normalize_to_u8(value: u16) -> u8 {
        ((value as f32 / 65535.0) * 255.0).clamp(0.0, 255.0) as u8
    }

    pub fn axial_slice(&self, index: usize) -> Option<ArrayView2<'_, u16>> {
        if index >= self.data.dim().0 {
            return None;
        }
        Some(self.data.slice(s![index, .., ..]))
    }

    /// Render one axial slice as an 8-bit grayscale image.
    pub fn axial_image(&self, index: usize) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.axial_slice(index)?;
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| Self::normalize_to_u8(v))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axial_image_spans_the_intensity_range() {
        let mut data = Array3::<u16>::zeros((2, 2, 3));
        data[[0, 0, 0]] = u16::MAX;
        data[[0, 1, 2]] = u16::MAX / 2;
        let volume = Volume::new(data, (1.0, 1.0, 1.0));

        let image = volume.axial_image(0).unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(0, 0).0[0], 255);
        assert_eq!(image.get_pixel(2, 1).0[0], 127);
        assert_eq!(image.get_pixel(1, 0).0[0], 0);
    }

    #[test]
    fn out_of_range_index_yields_nothing() {
        let volume = Volume::new(Array3::zeros((2, 2, 2)), (1.0, 1.0, 1.0));
        assert!(volume.axial_image(2).is_none());
    }
}
