//! Template-driven NIfTI output.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::nifti_io;
use crate::template::FilenameTemplate;
use crate::volume::Volume;

pub const DEFAULT_FILENAME_FORMAT: &str =
    "SubjectID-{PatientID}/{Modality}_{SeriesInstanceUID}_{IMAGE_ID}.nii.gz";

/// What to do when the rendered output path already exists.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExistingFileMode {
    /// Replace the file
    Overwrite,
    /// Abort with an error
    Fail,
    /// Keep the existing file and move on
    Skip,
}

/// Identity fields available to the filename template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputIdentity {
    pub patient_id: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub modality: String,
    pub image_id: String,
}

impl OutputIdentity {
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "PatientID" => &self.patient_id,
            "StudyInstanceUID" => &self.study_instance_uid,
            "SeriesInstanceUID" => &self.series_instance_uid,
            "Modality" => &self.modality,
            "IMAGE_ID" => &self.image_id,
            _ => return None,
        };
        Some(value.as_str())
    }

    fn sanitized(&self) -> Self {
        Self {
            patient_id: sanitize_filename(&self.patient_id),
            study_instance_uid: sanitize_filename(&self.study_instance_uid),
            series_instance_uid: sanitize_filename(&self.series_instance_uid),
            modality: sanitize_filename(&self.modality),
            image_id: sanitize_filename(&self.image_id),
        }
    }
}

/// Persists images under a root directory.
pub trait ImageWriter {
    fn root(&self) -> &Path;

    fn template(&self) -> &FilenameTemplate;

    /// Writes `image` and returns its absolute path.
    fn save(&self, image: &Volume, identity: &OutputIdentity) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct NiftiWriter {
    root: PathBuf,
    template: FilenameTemplate,
    create_dirs: bool,
    existing_file_mode: ExistingFileMode,
    sanitize: bool,
}

impl NiftiWriter {
    pub fn new(root: impl Into<PathBuf>, template: FilenameTemplate) -> Self {
        Self {
            root: root.into(),
            template,
            create_dirs: true,
            existing_file_mode: ExistingFileMode::Fail,
            sanitize: true,
        }
    }

    pub fn create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    pub fn existing_file_mode(mut self, mode: ExistingFileMode) -> Self {
        self.existing_file_mode = mode;
        self
    }

    pub fn sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    /// Path the identity would be written to, relative to the root.
    pub fn relative_path(&self, identity: &OutputIdentity) -> Result<String> {
        if self.sanitize {
            let clean = identity.sanitized();
            self.template.render(|name| clean.field(name))
        } else {
            self.template.render(|name| identity.field(name))
        }
    }
}

impl ImageWriter for NiftiWriter {
    fn root(&self) -> &Path {
        &self.root
    }

    fn template(&self) -> &FilenameTemplate {
        &self.template
    }

    fn save(&self, image: &Volume, identity: &OutputIdentity) -> Result<PathBuf> {
        let path = self.root.join(self.relative_path(identity)?);

        if path.exists() {
            match self.existing_file_mode {
                ExistingFileMode::Fail => return Err(Error::FileExists(path)),
                ExistingFileMode::Skip => {
                    info!(path = %path.display(), "output exists, skipping");
                    return Ok(path);
                }
                ExistingFileMode::Overwrite => debug!(path = %path.display(), "overwriting"),
            }
        }

        if let Some(parent) = path.parent() {
            if self.create_dirs {
                fs::create_dir_all(parent)?;
            }
        }

        nifti_io::write_nifti(image, &path)?;
        debug!(path = %path.display(), image_id = %identity.image_id, "saved image");
        Ok(path)
    }
}

/// Replaces anything other than alphanumerics, `-`, `_` and `.` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
