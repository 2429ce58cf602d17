//! Lazily pairs every RTSTRUCT mask with every CT image of the same patient.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::error::{Error, Result};
use crate::index::{DatasetIndex, IndexRecord};
use crate::loader::ImageLoader;
use crate::progress::ProgressReporter;
use crate::volume::Volume;

/// A loaded CT image and one of its masks.
#[derive(Debug, Clone)]
pub struct Subject {
    pub patient_id: String,
    pub image: Volume,
    pub mask: Volume,
    pub image_id: String,
    pub mask_id: String,
    pub image_modality: String,
    pub mask_modality: String,
}

/// Groups records by PatientID (ascending) and forms the RTSTRUCT × CT
/// product within each patient, RTSTRUCT-major, in file order.
pub fn pair_records(records: &[IndexRecord]) -> Vec<(IndexRecord, IndexRecord)> {
    let mut by_patient: BTreeMap<&str, Vec<&IndexRecord>> = BTreeMap::new();
    for record in records {
        by_patient.entry(record.patient_id()).or_default().push(record);
    }

    let mut pairs = Vec::new();
    for group in by_patient.values() {
        let rtstructs = group.iter().filter(|r| r.modality() == "RTSTRUCT");
        let cts: Vec<&IndexRecord> = group.iter().copied().filter(|r| r.modality() == "CT").collect();
        pairs.extend(
            rtstructs
                .cartesian_product(cts)
                .map(|(rt, ct)| ((*rt).clone(), ct.clone())),
        );
    }
    pairs
}

/// Opens `nifti_dir/index_filename` and returns an iterator that loads each
/// subject pair as it is consumed.
pub fn generate_image_mask_pairs<'a>(
    nifti_dir: &Path,
    index_filename: &str,
    loader: &'a dyn ImageLoader,
    progress: &'a mut dyn ProgressReporter,
) -> Result<SubjectPairs<'a>> {
    if !nifti_dir.is_dir() {
        return Err(Error::MissingDirectory(nifti_dir.to_path_buf()));
    }
    let index_path = nifti_dir.join(index_filename);
    if !index_path.is_file() {
        return Err(Error::MissingIndex {
            name: index_filename.to_string(),
            dir: nifti_dir.to_path_buf(),
        });
    }

    let index = DatasetIndex::read_csv(&index_path)?;
    let pairs = pair_records(&index.records);
    Ok(SubjectPairs::new(nifti_dir.to_path_buf(), pairs, loader, progress))
}

pub struct SubjectPairs<'a> {
    base: PathBuf,
    pairs: std::vec::IntoIter<(IndexRecord, IndexRecord)>,
    position: usize,
    loader: &'a dyn ImageLoader,
    progress: &'a mut dyn ProgressReporter,
    finished: bool,
}

impl<'a> SubjectPairs<'a> {
    fn new(
        base: PathBuf,
        pairs: Vec<(IndexRecord, IndexRecord)>,
        loader: &'a dyn ImageLoader,
        progress: &'a mut dyn ProgressReporter,
    ) -> Self {
        progress.start(pairs.len());
        Self {
            base,
            pairs: pairs.into_iter(),
            position: 0,
            loader,
            progress,
            finished: false,
        }
    }

    fn load(&self, rt: IndexRecord, ct: IndexRecord) -> Result<Subject> {
        if rt.patient_id() != ct.patient_id() {
            return Err(Error::PatientMismatch {
                image: ct.patient_id().to_string(),
                mask: rt.patient_id().to_string(),
            });
        }
        Ok(Subject {
            patient_id: ct.patient_id().to_string(),
            image: self.loader.load(&self.base.join(&ct.filepath))?,
            mask: self.loader.load(&self.base.join(&rt.filepath))?,
            image_id: ct.image_id().to_string(),
            mask_id: rt.image_id().to_string(),
            image_modality: ct.modality().to_string(),
            mask_modality: rt.modality().to_string(),
        })
    }
}

impl Iterator for SubjectPairs<'_> {
    type Item = Result<Subject>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some((rt, ct)) = self.pairs.next() else {
            if !self.finished {
                self.finished = true;
                self.progress.finish();
            }
            return None;
        };

        self.position += 1;
        let label = format!("Processing {} : {:<30}", ct.patient_id(), ct.image_id());
        self.progress.advance(self.position, &label);
        Some(self.load(rt, ct))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pairs.size_hint()
    }
}

impl ExactSizeIterator for SubjectPairs<'_> {}
