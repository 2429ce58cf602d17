//! Negative-control generation for radiomics cohorts.
//!
//! A DICOM cohort is scanned for CT series and their RTSTRUCTs, each CT is
//! written as NIfTI together with its ROI mask and a set of synthesized
//! negative-control images, and the output tree is indexed into a CSV that
//! downstream feature extraction can pair back into image/mask subjects.

mod dicom_file;

pub mod dicom_series;
pub mod discovery;
pub mod error;
pub mod index;
pub mod loader;
pub mod negative_control;
pub mod nifti_io;
pub mod pairing;
pub mod pipeline;
pub mod progress;
pub mod rtstruct;
pub mod template;
pub mod volume;
pub mod writer;

pub use error::{Error, Result};
