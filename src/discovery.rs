//! Cohort discovery: finds CT series and the RTSTRUCT that references each.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dicom_dictionary_std::tags;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::dicom_file::{self, items, string};
use crate::error::{Error, Result};

const CACHE_DIR: &str = ".negctl";
const CACHE_FILE: &str = "discovery.json";

/// One CT series with its linked RTSTRUCT.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PatientRecord {
    /// `{n}_{PatientID}`, unique within the cohort.
    pub subject_id: String,
    pub patient_id: String,
    pub study_instance_uid: String,
    pub series_ct: String,
    pub folder_ct: PathBuf,
    pub series_rtstruct: String,
    pub path_rtstruct: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiscoveryOptions {
    pub modalities: Vec<String>,
    /// Rescan even when a cached result exists.
    pub update: bool,
    pub n_jobs: usize,
    pub max_depth: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            modalities: vec!["CT".to_string(), "RTSTRUCT".to_string()],
            update: false,
            n_jobs: 1,
            max_depth: 10,
        }
    }
}

/// Turns a raw input tree into one record per usable CT series.
pub trait CohortDiscovery {
    fn discover(&self, input: &Path, options: &DiscoveryOptions) -> Result<Vec<PatientRecord>>;
}

#[derive(Serialize, Deserialize, Debug)]
struct DiscoveryCache {
    indexed_at: DateTime<Utc>,
    modalities: Vec<String>,
    patients: Vec<PatientRecord>,
}

/// Header fields of one DICOM instance.
#[derive(Debug, Clone)]
pub(crate) struct InstanceHeader {
    pub path: PathBuf,
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub modality: String,
    pub frame_of_reference: Option<String>,
    /// Series referenced by an RTSTRUCT.
    pub referenced_series: Vec<String>,
}

impl InstanceHeader {
    fn read(path: &Path) -> Result<Self> {
        let obj = dicom_file::open_header(path)?;
        let missing = |attribute| Error::DicomAttribute {
            attribute,
            path: path.to_path_buf(),
        };

        let mut frame_of_reference = string(&obj, tags::FRAME_OF_REFERENCE_UID);
        let mut referenced_series = Vec::new();
        for frame in items(&obj, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE) {
            if frame_of_reference.is_none() {
                frame_of_reference = string(frame, tags::FRAME_OF_REFERENCE_UID);
            }
            for study in items(frame, tags::RT_REFERENCED_STUDY_SEQUENCE) {
                for series in items(study, tags::RT_REFERENCED_SERIES_SEQUENCE) {
                    referenced_series.extend(string(series, tags::SERIES_INSTANCE_UID));
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            patient_id: string(&obj, tags::PATIENT_ID).ok_or_else(|| missing("PatientID"))?,
            study_uid: string(&obj, tags::STUDY_INSTANCE_UID).ok_or_else(|| missing("StudyInstanceUID"))?,
            series_uid: string(&obj, tags::SERIES_INSTANCE_UID).ok_or_else(|| missing("SeriesInstanceUID"))?,
            modality: string(&obj, tags::MODALITY).ok_or_else(|| missing("Modality"))?,
            frame_of_reference,
            referenced_series,
        })
    }
}

/// Walks a DICOM tree (or ZIP archive of one) and links RTSTRUCTs to CTs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomCohortScanner;

impl CohortDiscovery for DicomCohortScanner {
    fn discover(&self, input: &Path, options: &DiscoveryOptions) -> Result<Vec<PatientRecord>> {
        let modalities: Vec<String> = options.modalities.iter().map(|m| m.trim().to_uppercase()).collect();
        if !modalities.iter().any(|m| m == "CT") || !modalities.iter().any(|m| m == "RTSTRUCT") {
            return Err(Error::Modalities(options.modalities.clone()));
        }

        let cache_path = input.is_dir().then(|| input.join(CACHE_DIR).join(CACHE_FILE));
        if let Some(cache_path) = cache_path.as_deref().filter(|p| !options.update && p.is_file()) {
            let cache: DiscoveryCache = serde_json::from_reader(BufReader::new(File::open(cache_path)?))?;
            if cache.modalities == modalities {
                info!(
                    path = %cache_path.display(),
                    indexed_at = %cache.indexed_at,
                    patients = cache.patients.len(),
                    "using cached discovery"
                );
                return Ok(cache.patients);
            }
            debug!("cached discovery used a different modality filter, rescanning");
        }

        let files = collect_dicom_files(input, options.max_depth)?;
        info!(files = files.len(), input = %input.display(), "reading DICOM headers");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.n_jobs.max(1))
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let headers: Vec<InstanceHeader> = pool.install(|| {
            files
                .par_iter()
                .filter_map(|file| match InstanceHeader::read(file) {
                    Ok(header) => Some(header),
                    Err(e) => {
                        warn!(path = %file.display(), error = %e, "skipping unreadable DICOM file");
                        None
                    }
                })
                .collect()
        });

        let patients = link_series(&headers, &modalities);
        info!(patients = patients.len(), "discovered cohort");

        if let Some(cache_path) = cache_path {
            if let Some(parent) = cache_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let cache = DiscoveryCache {
                indexed_at: Utc::now(),
                modalities,
                patients: patients.clone(),
            };
            fs::write(&cache_path, serde_json::to_string_pretty(&cache)?)?;
        }
        Ok(patients)
    }
}

#[derive(Debug)]
struct SeriesEntry<'a> {
    first: &'a InstanceHeader,
    referenced_series: BTreeSet<&'a str>,
}

/// Groups instances by series and emits one record per CT series that an
/// RTSTRUCT refers to, ordered by PatientID then CT series.
pub(crate) fn link_series(headers: &[InstanceHeader], modalities: &[String]) -> Vec<PatientRecord> {
    let mut sorted: Vec<&InstanceHeader> = headers.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut series: BTreeMap<&str, SeriesEntry> = BTreeMap::new();
    for header in sorted {
        let entry = series.entry(header.series_uid.as_str()).or_insert_with(|| SeriesEntry {
            first: header,
            referenced_series: BTreeSet::new(),
        });
        entry
            .referenced_series
            .extend(header.referenced_series.iter().map(String::as_str));
    }

    let extra: Vec<&String> = modalities
        .iter()
        .filter(|m| *m != "CT" && *m != "RTSTRUCT")
        .collect();

    let mut cts: Vec<&SeriesEntry> = series.values().filter(|s| s.first.modality == "CT").collect();
    cts.sort_by(|a, b| {
        (a.first.patient_id.as_str(), a.first.series_uid.as_str())
            .cmp(&(b.first.patient_id.as_str(), b.first.series_uid.as_str()))
    });
    let rtstructs: Vec<&SeriesEntry> = series.values().filter(|s| s.first.modality == "RTSTRUCT").collect();

    let mut records = Vec::new();
    for ct in cts {
        let ct_header = ct.first;
        let linked = rtstructs
            .iter()
            .find(|rt| rt.referenced_series.contains(ct_header.series_uid.as_str()))
            .or_else(|| {
                rtstructs.iter().find(|rt| {
                    rt.referenced_series.is_empty()
                        && rt.first.patient_id == ct_header.patient_id
                        && rt.first.frame_of_reference.is_some()
                        && rt.first.frame_of_reference == ct_header.frame_of_reference
                })
            });
        let Some(rt) = linked else {
            debug!(patient = %ct_header.patient_id, series = %ct_header.series_uid, "CT series has no RTSTRUCT");
            continue;
        };

        let has_extras = extra.iter().all(|modality| {
            series
                .values()
                .any(|s| s.first.patient_id == ct_header.patient_id && &s.first.modality == *modality)
        });
        if !has_extras {
            debug!(patient = %ct_header.patient_id, "missing a requested modality");
            continue;
        }

        let Some(folder_ct) = ct_header.path.parent() else {
            continue;
        };
        records.push(PatientRecord {
            subject_id: format!("{}_{}", records.len(), ct_header.patient_id),
            patient_id: ct_header.patient_id.clone(),
            study_instance_uid: ct_header.study_uid.clone(),
            series_ct: ct_header.series_uid.clone(),
            folder_ct: folder_ct.to_path_buf(),
            series_rtstruct: rt.first.series_uid.clone(),
            path_rtstruct: rt.first.path.clone(),
        });
    }
    records
}

fn collect_dicom_files(input: &Path, max_depth: usize) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if input.is_file() {
        let is_zip = input
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip {
            info!(archive = %input.display(), "extracting ZIP archive");
            files.extend(extract_zip_files(input)?);
        } else {
            files.push(input.to_path_buf());
        }
    } else if input.is_dir() {
        for entry in WalkDir::new(input)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != CACHE_DIR)
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && dicom_file::is_likely_dicom_file(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
    } else {
        return Err(Error::MissingDirectory(input.to_path_buf()));
    }

    Ok(files)
}

fn extract_zip_files(zip_path: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let mut extracted_files = Vec::new();

    let temp_dir = std::env::temp_dir().join(format!("negctl_extract_{}", Uuid::new_v4()));
    fs::create_dir_all(&temp_dir)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(name) = file.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = %file.name(), "skipping ZIP entry with unsafe path");
            continue;
        };
        let file_path = temp_dir.join(name);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut output = File::create(&file_path)?;
        std::io::copy(&mut file, &mut output)?;

        if dicom_file::is_likely_dicom_file(&file_path) {
            extracted_files.push(file_path);
        }
    }

    Ok(extracted_files)
}
