//! Shared DICOM file helpers.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};

use crate::error::{Error, Result};

/// Opens a DICOM file, stopping before the pixel data.
pub(crate) fn open_header(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| Error::Dicom {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
}

pub(crate) fn open_full(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new().open_file(path).map_err(|e| Error::Dicom {
        path: path.to_path_buf(),
        source: Box::new(e),
    })
}

pub(crate) fn string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn floats(obj: &InMemDicomObject, tag: Tag) -> Option<Vec<f64>> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_multi_float64().ok())
}

pub(crate) fn int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_int::<i64>().ok())
}

/// Items of a sequence attribute; empty when absent.
pub(crate) fn items(obj: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.items())
        .unwrap_or(&[])
}

pub(crate) fn is_likely_dicom_file(path: &Path) -> bool {
    if let Some(ext) = path.extension() {
        let ext_str = ext.to_string_lossy().to_lowercase();
        if matches!(ext_str.as_str(), "dcm" | "dicom" | "ima") {
            return true;
        }
    }

    // Preamble followed by the DICM magic.
    if let Ok(mut file) = File::open(path) {
        let mut buffer = [0u8; 132];
        if file.read_exact(&mut buffer).is_ok() {
            return &buffer[128..132] == b"DICM";
        }
    }

    false
}

/// DICOM files directly inside `dir`, sorted by name. A file path is
/// returned as-is.
pub(crate) fn dicom_files_in(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file = entry.path();
        if entry.file_type()?.is_file() && is_likely_dicom_file(&file) {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

/// Builders for small synthetic DICOM files.
#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use dicom_core::value::DataSetSequence;
    use dicom_core::{DataElement, Length, PrimitiveValue, Tag, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

    use super::string;

    const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const RT_STRUCTURE_SET_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.481.3";

    pub type Element = DataElement<InMemDicomObject>;

    pub fn text(tag: Tag, vr: VR, value: &str) -> Element {
        DataElement::new(tag, vr, PrimitiveValue::from(value))
    }

    pub fn decimals(tag: Tag, values: &[f64]) -> Element {
        DataElement::new(
            tag,
            VR::DS,
            PrimitiveValue::Strs(values.iter().map(|v| v.to_string()).collect()),
        )
    }

    pub fn ushort(tag: Tag, value: u16) -> Element {
        DataElement::new(tag, VR::US, PrimitiveValue::from(value))
    }

    pub fn sequence(tag: Tag, items: Vec<InMemDicomObject>) -> Element {
        DataElement::new(tag, VR::SQ, DataSetSequence::new(items, Length::UNDEFINED))
    }

    /// One signed 16-bit CT slice on a 1 mm grid at `z`, with slope 2 and
    /// intercept -1024. `stored` is row-major.
    pub fn ct_slice(patient: &str, series: &str, z: f64, rows: u16, columns: u16, stored: &[i16]) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            text(tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE),
            text(tags::SOP_INSTANCE_UID, VR::UI, &format!("{series}.{}", z as i64 + 100)),
            text(tags::MODALITY, VR::CS, "CT"),
            text(tags::PATIENT_ID, VR::LO, patient),
            text(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.7"),
            text(tags::SERIES_INSTANCE_UID, VR::UI, series),
            text(tags::FRAME_OF_REFERENCE_UID, VR::UI, "1.2.826.0.1.8"),
            decimals(tags::IMAGE_POSITION_PATIENT, &[0.0, 0.0, z]),
            decimals(tags::IMAGE_ORIENTATION_PATIENT, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            decimals(tags::PIXEL_SPACING, &[1.0, 1.0]),
            decimals(tags::SLICE_THICKNESS, &[2.0]),
            decimals(tags::RESCALE_SLOPE, &[2.0]),
            decimals(tags::RESCALE_INTERCEPT, &[-1024.0]),
            ushort(tags::SAMPLES_PER_PIXEL, 1),
            text(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
            ushort(tags::ROWS, rows),
            ushort(tags::COLUMNS, columns),
            ushort(tags::BITS_ALLOCATED, 16),
            ushort(tags::BITS_STORED, 16),
            ushort(tags::HIGH_BIT, 15),
            ushort(tags::PIXEL_REPRESENTATION, 1),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OW,
                PrimitiveValue::U16(stored.iter().map(|&v| v as u16).collect()),
            ),
        ])
    }

    /// A structure set with one ROI per `(number, name)` and closed planar
    /// contours for the ROI numbered `contoured`.
    pub fn rtstruct(
        patient: &str,
        series: &str,
        referenced_series: &str,
        rois: &[(u16, &str)],
        contoured: u16,
        contours: &[Vec<[f64; 3]>],
    ) -> InMemDicomObject {
        let referenced = InMemDicomObject::from_element_iter([
            text(tags::FRAME_OF_REFERENCE_UID, VR::UI, "1.2.826.0.1.8"),
            sequence(
                tags::RT_REFERENCED_STUDY_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([sequence(
                    tags::RT_REFERENCED_SERIES_SEQUENCE,
                    vec![InMemDicomObject::from_element_iter([text(
                        tags::SERIES_INSTANCE_UID,
                        VR::UI,
                        referenced_series,
                    )])],
                )])],
            ),
        ]);
        let definitions = rois
            .iter()
            .map(|(number, name)| {
                InMemDicomObject::from_element_iter([
                    text(tags::ROI_NUMBER, VR::IS, &number.to_string()),
                    text(tags::ROI_NAME, VR::LO, name),
                ])
            })
            .collect();
        let contour_items = contours
            .iter()
            .map(|points| {
                let flat: Vec<f64> = points.iter().flatten().copied().collect();
                InMemDicomObject::from_element_iter([
                    text(tags::CONTOUR_GEOMETRIC_TYPE, VR::CS, "CLOSED_PLANAR"),
                    text(tags::NUMBER_OF_CONTOUR_POINTS, VR::IS, &points.len().to_string()),
                    decimals(tags::CONTOUR_DATA, &flat),
                ])
            })
            .collect();

        InMemDicomObject::from_element_iter([
            text(tags::SOP_CLASS_UID, VR::UI, RT_STRUCTURE_SET_STORAGE),
            text(tags::SOP_INSTANCE_UID, VR::UI, &format!("{series}.1")),
            text(tags::MODALITY, VR::CS, "RTSTRUCT"),
            text(tags::PATIENT_ID, VR::LO, patient),
            text(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.7"),
            text(tags::SERIES_INSTANCE_UID, VR::UI, series),
            sequence(tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE, vec![referenced]),
            sequence(tags::STRUCTURE_SET_ROI_SEQUENCE, definitions),
            sequence(
                tags::ROI_CONTOUR_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([
                    text(tags::REFERENCED_ROI_NUMBER, VR::IS, &contoured.to_string()),
                    sequence(tags::CONTOUR_SEQUENCE, contour_items),
                ])],
            ),
        ])
    }

    /// Writes `obj` as an explicit VR little endian Part 10 file.
    pub fn write(obj: InMemDicomObject, path: &Path) {
        let class = string(&obj, tags::SOP_CLASS_UID).unwrap();
        let instance = string(&obj, tags::SOP_INSTANCE_UID).unwrap();
        obj.with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(class)
                .media_storage_sop_instance_uid(instance),
        )
        .unwrap()
        .write_to_file(path)
        .unwrap();
    }
}
