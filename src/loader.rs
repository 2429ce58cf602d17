use std::path::Path;

use crate::dicom_series::DicomSeriesLoader;
use crate::error::Result;
use crate::nifti_io::NiftiLoader;
use crate::volume::Volume;

/// Reads a volumetric image from a file or series folder.
pub trait ImageLoader {
    fn load(&self, path: &Path) -> Result<Volume>;
}

/// Picks the NIfTI reader for `.nii`/`.nii.gz` files and the DICOM series
/// reader for everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoImageLoader;

impl ImageLoader for AutoImageLoader {
    fn load(&self, path: &Path) -> Result<Volume> {
        if is_nifti(path) {
            NiftiLoader.load(path)
        } else {
            DicomSeriesLoader.load(path)
        }
    }
}

pub(crate) fn is_nifti(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    path.is_file() && (name.ends_with(".nii") || name.ends_with(".nii.gz"))
}
