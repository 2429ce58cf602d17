//! Negative-control batch generation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::discovery::{CohortDiscovery, DicomCohortScanner, DiscoveryOptions, PatientRecord};
use crate::error::{Error, Result};
use crate::index;
use crate::loader::{AutoImageLoader, ImageLoader};
use crate::negative_control::{NegativeControl, NegativeControlSynthesizer, VoxelSynthesizer};
use crate::rtstruct::{MaskLoader, RoiPatterns, RtstructLoader};
use crate::template::FilenameTemplate;
use crate::writer::{ExistingFileMode, ImageWriter, NiftiWriter, OutputIdentity};

/// The collaborators a batch run delegates to.
pub struct Toolkit<'a> {
    pub image_loader: &'a dyn ImageLoader,
    pub mask_loader: &'a dyn MaskLoader,
    pub synthesizer: &'a dyn NegativeControlSynthesizer,
    pub writer: &'a dyn ImageWriter,
}

/// Last five characters of a UID, used to keep output names short.
pub fn uid_suffix(uid: &str) -> &str {
    match uid.char_indices().rev().nth(4) {
        Some((start, _)) => &uid[start..],
        None => uid,
    }
}

/// Writes the original CT, the ROI mask, and one image per negative control
/// for a single patient. Returns the written paths in write order.
///
/// The mask is named after the RTSTRUCT series it came from.
pub fn generate_and_save_negative_controls(
    patient: &PatientRecord,
    rois: &RoiPatterns,
    negative_controls: &[NegativeControl],
    random_seed: u64,
    toolkit: &Toolkit<'_>,
) -> Result<Vec<PathBuf>> {
    if rois.len() != 1 {
        return Err(Error::RoiMapping(format!("expected exactly one ROI, got {}", rois.len())));
    }
    let roi_name = rois.first_key().unwrap_or_default().to_string();

    let base_image = toolkit.image_loader.load(&patient.folder_ct)?;
    let mask_image = toolkit
        .mask_loader
        .load_masks(&patient.path_rtstruct, &base_image, rois)?
        .remove(&roi_name)
        .ok_or_else(|| Error::MissingRoi {
            roi: roi_name.clone(),
            path: patient.path_rtstruct.clone(),
        })?;

    let study = uid_suffix(&patient.study_instance_uid);
    let identity = |series: &str, modality: &str, image_id: &str| OutputIdentity {
        patient_id: patient.subject_id.clone(),
        study_instance_uid: study.to_string(),
        series_instance_uid: uid_suffix(series).to_string(),
        modality: modality.to_string(),
        image_id: image_id.to_string(),
    };

    let mut written = Vec::with_capacity(negative_controls.len() + 2);
    written.push(
        toolkit
            .writer
            .save(&base_image, &identity(&patient.series_ct, "CT", "original"))?,
    );
    written.push(
        toolkit
            .writer
            .save(&mask_image, &identity(&patient.series_rtstruct, "RTSTRUCT", &roi_name))?,
    );

    for (i, control) in negative_controls.iter().enumerate() {
        info!(
            control = %control,
            n = i + 1,
            total = negative_controls.len(),
            "generating negative control"
        );
        let image = toolkit
            .synthesizer
            .synthesize(&base_image, &mask_image, random_seed, *control)?;
        written.push(
            toolkit
                .writer
                .save(&image, &identity(&patient.series_ct, "CT", &control.to_string()))?,
        );
    }
    Ok(written)
}

/// Runs negative-control generation for every discovered patient, then
/// rebuilds the output index. Returns the index path.
pub fn index_and_submit_saves(
    input_dir: &Path,
    discovery: &dyn CohortDiscovery,
    discovery_options: &DiscoveryOptions,
    rois: &RoiPatterns,
    negative_controls: &[NegativeControl],
    random_seed: u64,
    toolkit: &Toolkit<'_>,
) -> Result<PathBuf> {
    let patients = discovery.discover(input_dir, discovery_options)?;

    for (p, patient) in patients.iter().enumerate() {
        info!(
            "Loading data for subject_ID {}/{}: {} (PatientID : {})",
            p + 1,
            patients.len(),
            patient.subject_id,
            patient.patient_id
        );
        let written = generate_and_save_negative_controls(patient, rois, negative_controls, random_seed, toolkit)?;
        debug!(subject = %patient.subject_id, files = written.len(), "patient done");
    }

    let csv_path = index::rebuild_index_csv(toolkit.writer.root(), toolkit.writer.template())?;
    info!(path = %csv_path.display(), "wrote dataset index");
    Ok(csv_path)
}

/// Fully resolved settings for one batch run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub modalities: Vec<String>,
    pub roi: String,
    pub negative_controls: Vec<String>,
    pub random_seed: u64,
    pub filename_format: String,
    pub existing_file_mode: ExistingFileMode,
    pub update_index: bool,
    pub n_jobs: usize,
    pub max_depth: usize,
    pub sanitize_filenames: bool,
}

impl RunConfig {
    /// Runs the batch with the DICOM/NIfTI implementations of every
    /// collaborator.
    pub fn execute(&self) -> Result<PathBuf> {
        let rois = RoiPatterns::parse(&self.roi)?;
        let controls = self
            .negative_controls
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<NegativeControl>>>()?;
        let template = FilenameTemplate::parse(&self.filename_format)?;

        let writer = NiftiWriter::new(&self.output_dir, template)
            .create_dirs(true)
            .existing_file_mode(self.existing_file_mode)
            .sanitize(self.sanitize_filenames);
        let toolkit = Toolkit {
            image_loader: &AutoImageLoader,
            mask_loader: &RtstructLoader,
            synthesizer: &VoxelSynthesizer,
            writer: &writer,
        };
        let discovery_options = DiscoveryOptions {
            modalities: self.modalities.clone(),
            update: self.update_index,
            n_jobs: self.n_jobs,
            max_depth: self.max_depth,
        };

        std::fs::create_dir_all(&self.output_dir)?;
        index_and_submit_saves(
            &self.input_dir,
            &DicomCohortScanner,
            &discovery_options,
            &rois,
            &controls,
            self.random_seed,
            &toolkit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{DatasetIndex, INDEX_FILENAME};
    use crate::negative_control::{Method, Region};
    use crate::volume::{Geometry, Volume};
    use crate::writer::DEFAULT_FILENAME_FORMAT;
    use ndarray::Array3;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    struct FakeImages;

    impl ImageLoader for FakeImages {
        fn load(&self, _path: &Path) -> Result<Volume> {
            Ok(Volume::new(
                Array3::from_shape_fn((4, 4, 2), |(i, j, k)| (i + 4 * j + 16 * k) as f32),
                Geometry::default(),
            ))
        }
    }

    struct FakeMasks;

    impl MaskLoader for FakeMasks {
        fn load_masks(&self, _rtstruct: &Path, reference: &Volume, rois: &RoiPatterns) -> Result<BTreeMap<String, Volume>> {
            let mut mask = reference.empty_label_like();
            mask.data[[1, 1, 0]] = 1.0;
            mask.data[[2, 1, 0]] = 1.0;
            Ok(rois.keys().map(|k| (k.to_string(), mask.clone())).collect())
        }
    }

    struct FakeCohort(Vec<PatientRecord>);

    impl CohortDiscovery for FakeCohort {
        fn discover(&self, _input: &Path, _options: &DiscoveryOptions) -> Result<Vec<PatientRecord>> {
            Ok(self.0.clone())
        }
    }

    fn patient(n: usize, id: &str) -> PatientRecord {
        PatientRecord {
            subject_id: format!("{n}_{id}"),
            patient_id: id.into(),
            study_instance_uid: "1.2.840.10008.99999".into(),
            series_ct: "1.2.840.10008.54321".into(),
            folder_ct: PathBuf::from("ct"),
            series_rtstruct: "1.2.840.10008.67890".into(),
            path_rtstruct: PathBuf::from("rt.dcm"),
        }
    }

    fn writer(root: &Path) -> NiftiWriter {
        NiftiWriter::new(root, FilenameTemplate::parse(DEFAULT_FILENAME_FORMAT).unwrap())
    }

    #[test]
    fn uid_suffix_keeps_the_last_five_characters() {
        assert_eq!(uid_suffix("1.2.840.10008.54321"), "54321");
        assert_eq!(uid_suffix("1.2"), "1.2");
        assert_eq!(uid_suffix("12345"), "12345");
    }

    #[test]
    fn one_patient_writes_original_mask_and_controls() {
        let tmp = TempDir::new().unwrap();
        let writer = writer(tmp.path());
        let toolkit = Toolkit {
            image_loader: &FakeImages,
            mask_loader: &FakeMasks,
            synthesizer: &VoxelSynthesizer,
            writer: &writer,
        };
        let rois = RoiPatterns::parse("GTV=GTV.*").unwrap();
        let controls = [
            NegativeControl::new(Method::Shuffled, Region::Full),
            NegativeControl::new(Method::RandomizedSampled, Region::Roi),
        ];

        let written = generate_and_save_negative_controls(&patient(0, "HN-1"), &rois, &controls, 10, &toolkit).unwrap();

        let relative: Vec<String> = written
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            relative,
            vec![
                "SubjectID-0_HN-1/CT_54321_original.nii.gz",
                "SubjectID-0_HN-1/RTSTRUCT_67890_GTV.nii.gz",
                "SubjectID-0_HN-1/CT_54321_shuffled_full.nii.gz",
                "SubjectID-0_HN-1/CT_54321_randomized_sampled_roi.nii.gz",
            ]
        );
        assert!(written.iter().all(|p| p.is_file()));
    }

    #[test]
    fn more_than_one_roi_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let writer = writer(tmp.path());
        let toolkit = Toolkit {
            image_loader: &FakeImages,
            mask_loader: &FakeMasks,
            synthesizer: &VoxelSynthesizer,
            writer: &writer,
        };
        let rois = RoiPatterns::new()
            .with("GTV", &["GTV"])
            .unwrap()
            .with("Body", &["BODY"])
            .unwrap();
        assert!(matches!(
            generate_and_save_negative_controls(&patient(0, "A"), &rois, &[], 1, &toolkit),
            Err(Error::RoiMapping(_))
        ));
    }

    #[test]
    fn batch_run_rebuilds_a_sorted_index() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let writer = writer(&out);
        let toolkit = Toolkit {
            image_loader: &FakeImages,
            mask_loader: &FakeMasks,
            synthesizer: &VoxelSynthesizer,
            writer: &writer,
        };
        let cohort = FakeCohort(vec![patient(0, "B"), patient(1, "A")]);
        let rois = RoiPatterns::parse("GTV").unwrap();
        let controls = [NegativeControl::new(Method::Randomized, Region::NonRoi)];

        let csv_path = index_and_submit_saves(
            tmp.path(),
            &cohort,
            &DiscoveryOptions::default(),
            &rois,
            &controls,
            10,
            &toolkit,
        )
        .unwrap();

        assert_eq!(csv_path, out.join(INDEX_FILENAME));
        let index = DatasetIndex::read_csv(&csv_path).unwrap();
        let rows: Vec<(&str, &str, &str)> = index
            .records
            .iter()
            .map(|r| (r.patient_id(), r.modality(), r.image_id()))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("0_B", "RTSTRUCT", "GTV"),
                ("0_B", "CT", "original"),
                ("0_B", "CT", "randomized_non_roi"),
                ("1_A", "RTSTRUCT", "GTV"),
                ("1_A", "CT", "original"),
                ("1_A", "CT", "randomized_non_roi"),
            ]
        );
    }

    #[test]
    fn generated_controls_are_reproducible_on_disk() {
        let tmp = TempDir::new().unwrap();
        let controls = [NegativeControl::new(Method::Shuffled, Region::Roi)];
        let rois = RoiPatterns::parse("GTV").unwrap();

        let mut outputs = Vec::new();
        for run in ["a", "b"] {
            let writer = writer(&tmp.path().join(run));
            let toolkit = Toolkit {
                image_loader: &FakeImages,
                mask_loader: &FakeMasks,
                synthesizer: &VoxelSynthesizer,
                writer: &writer,
            };
            let written = generate_and_save_negative_controls(&patient(0, "A"), &rois, &controls, 42, &toolkit).unwrap();
            outputs.push(crate::nifti_io::read_nifti(&written[2]).unwrap().data);
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 2);
    }
}
