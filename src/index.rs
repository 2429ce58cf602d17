//! The `dataset_index.csv` table of written images.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::template::FilenameTemplate;

pub const INDEX_FILENAME: &str = "dataset_index.csv";
pub const IMAGE_EXTENSION: &str = ".nii.gz";

pub const PATIENT_ID: &str = "PatientID";
pub const MODALITY: &str = "Modality";
pub const IMAGE_ID: &str = "IMAGE_ID";
pub const FILEPATH: &str = "filepath";

/// One image file: its template fields plus its path relative to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub fields: Vec<(String, String)>,
    /// `/`-separated, relative to the output root.
    pub filepath: String,
}

impl IndexRecord {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn patient_id(&self) -> &str {
        self.get(PATIENT_ID).unwrap_or_default()
    }

    pub fn modality(&self) -> &str {
        self.get(MODALITY).unwrap_or_default()
    }

    pub fn image_id(&self) -> &str {
        self.get(IMAGE_ID).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetIndex {
    /// Field columns in output order; `filepath` is always written last.
    pub columns: Vec<String>,
    pub records: Vec<IndexRecord>,
}

impl DatasetIndex {
    /// Reads an index written by [`write_csv`](Self::write_csv) or by any tool
    /// producing the same columns.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        for column in [PATIENT_ID, MODALITY, IMAGE_ID, FILEPATH] {
            if !headers.iter().any(|h| h == column) {
                return Err(Error::MissingColumn {
                    path: path.to_path_buf(),
                    column,
                });
            }
        }

        let columns: Vec<String> = headers
            .iter()
            .filter(|h| *h != FILEPATH)
            .map(str::to_string)
            .collect();

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let mut fields = Vec::with_capacity(columns.len());
            let mut filepath = String::new();
            for (header, value) in headers.iter().zip(row.iter()) {
                if header == FILEPATH {
                    filepath = value.to_string();
                } else {
                    fields.push((header.to_string(), value.to_string()));
                }
            }
            records.push(IndexRecord { fields, filepath });
        }

        Ok(Self { columns, records })
    }

    /// Scans `root` for images whose relative path was produced by
    /// `template`, sorted by (PatientID, IMAGE_ID). Other files are ignored.
    pub fn rebuild(root: &Path, template: &FilenameTemplate) -> Result<Self> {
        let matcher = template.matcher()?;
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || !entry.file_name().to_string_lossy().ends_with(IMAGE_EXTENSION) {
                continue;
            }
            let relative = normalize(entry.path().strip_prefix(root).unwrap_or(entry.path()));
            match matcher.captures(&relative) {
                Some(fields) => records.push(IndexRecord {
                    fields,
                    filepath: relative,
                }),
                None => {
                    debug!(path = %relative, "does not match filename template");
                    skipped += 1;
                }
            }
        }

        // Stable: ties keep discovery order.
        records.sort_by(|a, b| {
            a.patient_id()
                .cmp(b.patient_id())
                .then_with(|| a.image_id().cmp(b.image_id()))
        });

        info!(matched = records.len(), skipped, root = %root.display(), "rebuilt dataset index");
        Ok(Self {
            columns: matcher.fields().to_vec(),
            records,
        })
    }

    /// Writes a header row then one row per record, `filepath` last.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let header: Vec<&str> = self
            .columns
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(FILEPATH))
            .collect();
        writer.write_record(&header)?;

        for record in &self.records {
            let row: Vec<&str> = self
                .columns
                .iter()
                .map(|column| record.get(column).unwrap_or_default())
                .chain(std::iter::once(record.filepath.as_str()))
                .collect();
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Rebuilds `root`'s index from disk and writes it to
/// `root/dataset_index.csv`.
pub fn rebuild_index_csv(root: &Path, template: &FilenameTemplate) -> Result<PathBuf> {
    let index = DatasetIndex::rebuild(root, template)?;
    let csv_path = root.join(INDEX_FILENAME);
    index.write_csv(&csv_path)?;
    Ok(csv_path)
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DEFAULT_FILENAME_FORMAT;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    fn template() -> FilenameTemplate {
        FilenameTemplate::parse(DEFAULT_FILENAME_FORMAT).unwrap()
    }

    #[test]
    fn single_file_scenario() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "SubjectID-001/CT_54321_original.nii.gz");

        let csv_path = rebuild_index_csv(tmp.path(), &template()).unwrap();
        assert_eq!(csv_path, tmp.path().join(INDEX_FILENAME));
        assert_eq!(
            fs::read_to_string(&csv_path).unwrap(),
            "PatientID,Modality,SeriesInstanceUID,IMAGE_ID,filepath\n\
             001,CT,54321,original,SubjectID-001/CT_54321_original.nii.gz\n"
        );

        let index = DatasetIndex::read_csv(&csv_path).unwrap();
        assert_eq!(index.len(), 1);
        let record = &index.records[0];
        assert_eq!(record.patient_id(), "001");
        assert_eq!(record.modality(), "CT");
        assert_eq!(record.get("SeriesInstanceUID"), Some("54321"));
        assert_eq!(record.image_id(), "original");
    }

    #[test]
    fn rows_are_sorted_and_foreign_files_skipped() {
        let tmp = TempDir::new().unwrap();
        for rel in [
            "SubjectID-2/CT_11111_shuffled_full.nii.gz",
            "SubjectID-2/CT_11111_original.nii.gz",
            "SubjectID-1/RTSTRUCT_22222_GTV.nii.gz",
            "SubjectID-1/CT_11111_original.nii.gz",
            "SubjectID-1/notes.txt",
            "stray.nii.gz",
            "SubjectID-1/extra/CT_1_x.nii",
        ] {
            touch(tmp.path(), rel);
        }

        let index = DatasetIndex::rebuild(tmp.path(), &template()).unwrap();
        let order: Vec<(&str, &str)> = index
            .records
            .iter()
            .map(|r| (r.patient_id(), r.image_id()))
            .collect();
        assert_eq!(
            order,
            vec![("1", "GTV"), ("1", "original"), ("2", "original"), ("2", "shuffled_full")]
        );
    }

    #[test]
    fn equal_keys_keep_walk_order() {
        let tmp = TempDir::new().unwrap();
        let template = FilenameTemplate::parse("{PatientID}/{IMAGE_ID}/{SeriesInstanceUID}_{Modality}.nii.gz").unwrap();
        for rel in [
            "P1/GTV/3_CT.nii.gz",
            "P1/GTV/1_RTSTRUCT.nii.gz",
            "P1/GTV/2_MR.nii.gz",
            "P1/BODY/9_RTSTRUCT.nii.gz",
        ] {
            touch(tmp.path(), rel);
        }

        let index = DatasetIndex::rebuild(tmp.path(), &template).unwrap();
        let order: Vec<(&str, &str)> = index
            .records
            .iter()
            .map(|r| (r.image_id(), r.modality()))
            .collect();
        assert_eq!(
            order,
            vec![("BODY", "RTSTRUCT"), ("GTV", "RTSTRUCT"), ("GTV", "MR"), ("GTV", "CT")]
        );
    }

    #[test]
    fn rebuild_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "SubjectID-7/CT_1_original.nii.gz");
        touch(tmp.path(), "SubjectID-3/CT_1_original.nii.gz");

        let path = rebuild_index_csv(tmp.path(), &template()).unwrap();
        let first = fs::read(&path).unwrap();
        rebuild_index_csv(tmp.path(), &template()).unwrap();
        assert_eq!(first, fs::read(&path).unwrap());
    }

    #[test]
    fn empty_tree_writes_header_only() {
        let tmp = TempDir::new().unwrap();
        let path = rebuild_index_csv(tmp.path(), &template()).unwrap();
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "PatientID,Modality,SeriesInstanceUID,IMAGE_ID,filepath\n"
        );
    }

    #[test]
    fn reading_requires_the_pairing_columns() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(INDEX_FILENAME);
        fs::write(&path, "PatientID,IMAGE_ID,filepath\n1,original,a.nii.gz\n").unwrap();
        assert!(matches!(
            DatasetIndex::read_csv(&path),
            Err(Error::MissingColumn { column: MODALITY, .. })
        ));
    }
}
