use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while discovering, generating and indexing a cohort.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{} does not exist or is not a directory", .0.display())]
    MissingDirectory(PathBuf),

    #[error("{name} not found in {}", dir.display())]
    MissingIndex { name: String, dir: PathBuf },

    #[error("index {} is missing required column {column}", path.display())]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("PatientID mismatch: RTSTRUCT row has {mask}, CT row has {image}")]
    PatientMismatch { image: String, mask: String },

    #[error("invalid filename template {template:?}: {reason}")]
    Template { template: String, reason: String },

    #[error("template field {0:?} has no value")]
    MissingField(String),

    #[error("output file already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("geometry mismatch: {0}")]
    Geometry(String),

    #[error("unknown negative control {0:?}")]
    UnknownNegativeControl(String),

    #[error("ROI {roi:?} not found in {}", path.display())]
    MissingRoi { roi: String, path: PathBuf },

    #[error("invalid ROI mapping: {0}")]
    RoiMapping(String),

    #[error("DICOM attribute {attribute} missing or invalid in {}", path.display())]
    DicomAttribute { attribute: &'static str, path: PathBuf },

    #[error("unsupported modality filter {0:?}: CT and RTSTRUCT are both required")]
    Modalities(Vec<String>),

    #[error("no DICOM slices found in {}", .0.display())]
    EmptySeries(PathBuf),

    #[error("unsupported pixel data in {}: {reason}", path.display())]
    PixelData { path: PathBuf, reason: String },

    #[error("failed to read DICOM file {}: {source}", path.display())]
    Dicom {
        path: PathBuf,
        #[source]
        source: Box<dicom_object::ReadError>,
    },

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
