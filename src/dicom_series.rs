//! Assembles a single-frame DICOM image series into a [`Volume`].

use std::path::{Path, PathBuf};

use dicom_core::value::{PrimitiveValue, Value};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use ndarray::Array3;
use tracing::{debug, warn};

use crate::dicom_file::{self, floats, int, string};
use crate::error::{Error, Result};
use crate::loader::ImageLoader;
use crate::volume::{Geometry, Volume};

/// Loads every image slice in a series folder. Only native (uncompressed)
/// pixel data is supported.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomSeriesLoader;

impl ImageLoader for DicomSeriesLoader {
    fn load(&self, path: &Path) -> Result<Volume> {
        let mut slices = Vec::new();
        let mut series_uid: Option<String> = None;
        let mut foreign = 0usize;
        for file in dicom_file::dicom_files_in(path)? {
            let obj = dicom_file::open_full(&file)?;
            if string(&obj, tags::MODALITY).as_deref() == Some("RTSTRUCT") || int(&obj, tags::ROWS).is_none() {
                continue;
            }
            let uid = string(&obj, tags::SERIES_INSTANCE_UID);
            if series_uid.is_none() {
                series_uid = uid;
            } else if uid != series_uid {
                foreign += 1;
                continue;
            }
            slices.push(Slice::read(&obj, file)?);
        }
        if foreign > 0 {
            warn!(path = %path.display(), skipped = foreign, "folder mixes several series, kept the first");
        }
        if slices.is_empty() {
            return Err(Error::EmptySeries(path.to_path_buf()));
        }
        debug!(path = %path.display(), slices = slices.len(), "loaded DICOM series");
        assemble(slices)
    }
}

#[derive(Debug)]
struct Slice {
    path: PathBuf,
    rows: usize,
    columns: usize,
    position: [f64; 3],
    orientation: [f64; 6],
    pixel_spacing: [f64; 2],
    thickness: Option<f64>,
    pixels: Vec<f32>,
}

impl Slice {
    fn read(obj: &InMemDicomObject, path: PathBuf) -> Result<Self> {
        let missing = |attribute| Error::DicomAttribute {
            attribute,
            path: path.clone(),
        };

        let rows = int(obj, tags::ROWS).ok_or_else(|| missing("Rows"))? as usize;
        let columns = int(obj, tags::COLUMNS).ok_or_else(|| missing("Columns"))? as usize;
        let position = floats(obj, tags::IMAGE_POSITION_PATIENT)
            .and_then(|v| <[f64; 3]>::try_from(v).ok())
            .ok_or_else(|| missing("ImagePositionPatient"))?;
        let orientation = floats(obj, tags::IMAGE_ORIENTATION_PATIENT)
            .and_then(|v| <[f64; 6]>::try_from(v).ok())
            .ok_or_else(|| missing("ImageOrientationPatient"))?;
        let pixel_spacing = floats(obj, tags::PIXEL_SPACING)
            .and_then(|v| <[f64; 2]>::try_from(v).ok())
            .unwrap_or([1.0, 1.0]);
        let thickness = floats(obj, tags::SLICE_THICKNESS).and_then(|v| v.first().copied());

        let slope = floats(obj, tags::RESCALE_SLOPE)
            .and_then(|v| v.first().copied())
            .unwrap_or(1.0);
        let intercept = floats(obj, tags::RESCALE_INTERCEPT)
            .and_then(|v| v.first().copied())
            .unwrap_or(0.0);
        let bits = int(obj, tags::BITS_ALLOCATED).unwrap_or(16);
        let signed = int(obj, tags::PIXEL_REPRESENTATION) == Some(1);

        let raw = stored_values(obj, &path, bits, signed)?;
        if raw.len() < rows * columns {
            return Err(Error::PixelData {
                path,
                reason: format!("expected {} pixels, found {}", rows * columns, raw.len()),
            });
        }
        let pixels = raw
            .into_iter()
            .take(rows * columns)
            .map(|v| (v * slope + intercept) as f32)
            .collect();

        Ok(Self {
            path,
            rows,
            columns,
            position,
            orientation,
            pixel_spacing,
            thickness,
            pixels,
        })
    }

    fn row_direction(&self) -> [f64; 3] {
        [self.orientation[0], self.orientation[1], self.orientation[2]]
    }

    fn column_direction(&self) -> [f64; 3] {
        [self.orientation[3], self.orientation[4], self.orientation[5]]
    }
}

fn stored_values(obj: &InMemDicomObject, path: &Path, bits: i64, signed: bool) -> Result<Vec<f64>> {
    let unsupported = |reason: &str| Error::PixelData {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let elem = obj
        .element_opt(tags::PIXEL_DATA)
        .ok()
        .flatten()
        .ok_or_else(|| unsupported("no pixel data"))?;

    let values: Vec<f64> = match elem.value() {
        Value::Primitive(PrimitiveValue::U16(vals)) if signed => vals.iter().map(|&v| f64::from(v as i16)).collect(),
        Value::Primitive(PrimitiveValue::U16(vals)) => vals.iter().map(|&v| f64::from(v)).collect(),
        Value::Primitive(PrimitiveValue::I16(vals)) => vals.iter().map(|&v| f64::from(v)).collect(),
        Value::Primitive(PrimitiveValue::U8(bytes)) if bits == 16 => bytes
            .chunks_exact(2)
            .map(|pair| {
                let word = u16::from_le_bytes([pair[0], pair[1]]);
                if signed { f64::from(word as i16) } else { f64::from(word) }
            })
            .collect(),
        Value::Primitive(PrimitiveValue::U8(bytes)) if bits == 8 => bytes
            .iter()
            .map(|&v| if signed { f64::from(v as i8) } else { f64::from(v) })
            .collect(),
        Value::PixelSequence { .. } => return Err(unsupported("encapsulated (compressed) pixel data")),
        _ => return Err(unsupported("unexpected pixel data representation")),
    };
    Ok(values)
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn assemble(mut slices: Vec<Slice>) -> Result<Volume> {
    let first = &slices[0];
    let (rows, columns) = (first.rows, first.columns);
    let row_dir = first.row_direction();
    let col_dir = first.column_direction();
    let normal = cross(row_dir, col_dir);

    if let Some(odd) = slices.iter().find(|s| s.rows != rows || s.columns != columns) {
        return Err(Error::Geometry(format!(
            "{} is {}x{}, series is {rows}x{columns}",
            odd.path.display(),
            odd.rows,
            odd.columns
        )));
    }

    slices.sort_by(|a, b| dot(a.position, normal).total_cmp(&dot(b.position, normal)));

    let slice_spacing = match slices.as_slice() {
        [a, b, ..] => {
            let step = dot(b.position, normal) - dot(a.position, normal);
            if step.abs() > f64::EPSILON { step.abs() } else { a.thickness.unwrap_or(1.0) }
        }
        [only] => only.thickness.unwrap_or(1.0),
        [] => 1.0,
    };

    let first = &slices[0];
    let geometry = Geometry {
        // PixelSpacing is (row spacing, column spacing).
        spacing: [first.pixel_spacing[1], first.pixel_spacing[0], slice_spacing],
        origin: first.position,
        direction: [
            [row_dir[0], col_dir[0], normal[0]],
            [row_dir[1], col_dir[1], normal[1]],
            [row_dir[2], col_dir[2], normal[2]],
        ],
    };

    let mut data = Array3::<f32>::zeros((columns, rows, slices.len()));
    for (k, slice) in slices.iter().enumerate() {
        for r in 0..rows {
            for c in 0..columns {
                data[[c, r, k]] = slice.pixels[r * columns + c];
            }
        }
    }

    Ok(Volume::new(data, geometry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicom_file::testing;
    use dicom_core::value::PixelFragmentSequence;
    use dicom_core::{DataElement, VR};
    use tempfile::TempDir;

    fn slice(z: f64, fill: f32) -> Slice {
        Slice {
            path: PathBuf::from(format!("slice_{z}.dcm")),
            rows: 2,
            columns: 3,
            position: [-10.0, -20.0, z],
            orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            pixel_spacing: [0.5, 0.7],
            thickness: Some(3.0),
            pixels: (0..6).map(|v| v as f32 + fill).collect(),
        }
    }

    #[test]
    fn slices_are_stacked_along_the_normal() {
        let volume = assemble(vec![slice(5.0, 200.0), slice(-5.0, 0.0), slice(0.0, 100.0)]).unwrap();

        assert_eq!(volume.shape(), (3, 2, 3));
        assert_eq!(volume.geometry.origin, [-10.0, -20.0, -5.0]);
        assert_eq!(volume.geometry.spacing, [0.7, 0.5, 5.0]);
        // pixel (row 1, col 2) of the middle slice
        assert_eq!(volume.data[[2, 1, 1]], 105.0);
        assert_eq!(volume.data[[0, 0, 2]], 200.0);
    }

    #[test]
    fn single_slice_uses_thickness() {
        let volume = assemble(vec![slice(0.0, 0.0)]).unwrap();
        assert_eq!(volume.geometry.spacing[2], 3.0);
    }

    #[test]
    fn mixed_slice_sizes_are_rejected() {
        let mut odd = slice(1.0, 0.0);
        odd.rows = 4;
        assert!(matches!(assemble(vec![slice(0.0, 0.0), odd]), Err(Error::Geometry(_))));
    }

    #[test]
    fn signed_pixels_are_rescaled() {
        let obj = testing::ct_slice("P1", "1.2.3", 0.0, 2, 2, &[-1, 0, 1, 100]);
        let slice = Slice::read(&obj, PathBuf::from("mem.dcm")).unwrap();

        assert_eq!((slice.rows, slice.columns), (2, 2));
        assert_eq!(slice.pixels, vec![-1026.0, -1024.0, -1022.0, -824.0]);
        assert_eq!(slice.thickness, Some(2.0));
    }

    #[test]
    fn byte_pixel_data_is_read_as_little_endian_words() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::U8([0x10, 0x00, 0xff, 0xff].into_iter().collect()),
        )]);
        let path = Path::new("mem.dcm");

        assert_eq!(stored_values(&obj, path, 16, false).unwrap(), vec![16.0, 65535.0]);
        assert_eq!(stored_values(&obj, path, 16, true).unwrap(), vec![16.0, -1.0]);
        assert_eq!(stored_values(&obj, path, 8, false).unwrap(), vec![16.0, 0.0, 255.0, 255.0]);
    }

    #[test]
    fn encapsulated_pixel_data_is_rejected() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PixelFragmentSequence::new(Vec::<u32>::new(), vec![vec![0u8; 8]]),
        )]);
        assert!(matches!(
            stored_values(&obj, Path::new("mem.dcm"), 16, false),
            Err(Error::PixelData { .. })
        ));
    }

    #[test]
    fn series_folder_loads_sorted_and_skips_structure_sets() {
        let tmp = TempDir::new().unwrap();
        let upper: Vec<i16> = (10..16).collect();
        let lower: Vec<i16> = (0..6).collect();
        // file names run opposite to slice position
        testing::write(testing::ct_slice("P1", "1.2.3", 2.0, 2, 3, &upper), &tmp.path().join("1.dcm"));
        testing::write(testing::ct_slice("P1", "1.2.3", 0.0, 2, 3, &lower), &tmp.path().join("2.dcm"));
        testing::write(
            testing::rtstruct("P1", "1.2.9", "1.2.3", &[(1, "GTV")], 1, &[]),
            &tmp.path().join("3.dcm"),
        );

        let volume = DicomSeriesLoader.load(tmp.path()).unwrap();

        assert_eq!(volume.shape(), (3, 2, 2));
        assert_eq!(volume.geometry.spacing, [1.0, 1.0, 2.0]);
        assert_eq!(volume.geometry.origin, [0.0, 0.0, 0.0]);
        // row 1, column 2 of the z = 0 slice holds stored value 5
        assert_eq!(volume.data[[2, 1, 0]], 5.0 * 2.0 - 1024.0);
        assert_eq!(volume.data[[0, 0, 1]], 10.0 * 2.0 - 1024.0);
    }

    #[test]
    fn folder_without_images_is_an_empty_series() {
        let tmp = TempDir::new().unwrap();
        testing::write(
            testing::rtstruct("P1", "1.2.9", "1.2.3", &[(1, "GTV")], 1, &[]),
            &tmp.path().join("rt.dcm"),
        );
        assert!(matches!(DicomSeriesLoader.load(tmp.path()), Err(Error::EmptySeries(_))));
    }
}
