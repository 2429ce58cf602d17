//! NIfTI reading and writing for [`Volume`]s.
//!
//! NIfTI affines are RAS while [`Geometry`] is LPS, so the first two rows are
//! negated on the way in and out.

use std::path::Path;

use ndarray::Ix3;
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::error::{Error, Result};
use crate::loader::ImageLoader;
use crate::volume::{Geometry, Volume, VoxelKind};

const SFORM_SCANNER_ANAT: i16 = 1;
const UNITS_MM: u8 = 2;

/// Loads `.nii` / `.nii.gz` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct NiftiLoader;

impl ImageLoader for NiftiLoader {
    fn load(&self, path: &Path) -> Result<Volume> {
        read_nifti(path)
    }
}

pub fn read_nifti(path: &Path) -> Result<Volume> {
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let data = obj
        .into_volume()
        .into_ndarray::<f32>()?
        .into_dimensionality::<Ix3>()
        .map_err(|e| Error::Geometry(format!("{} is not a 3-D volume: {e}", path.display())))?;

    let kind = if header.intent_code == 1002 || header.datatype == 2 {
        VoxelKind::Label
    } else {
        VoxelKind::Intensity
    };

    Ok(Volume {
        data,
        geometry: geometry_from_header(&header),
        kind,
    })
}

/// Writes `volume` to `path`; a `.gz` suffix selects gzip compression.
/// Label volumes are stored as unsigned bytes.
pub fn write_nifti(volume: &Volume, path: &Path) -> Result<()> {
    let header = header_from_geometry(&volume.geometry, volume.kind);
    let options = WriterOptions::new(path).reference_header(&header);
    match volume.kind {
        VoxelKind::Label => options.write_nifti(&volume.data.mapv(|v| v.round().clamp(0.0, 255.0) as u8))?,
        VoxelKind::Intensity => options.write_nifti(&volume.data)?,
    }
    Ok(())
}

fn header_from_geometry(geometry: &Geometry, kind: VoxelKind) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    let mut rows = [[0f32; 4]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        let flip = if r < 2 { -1.0 } else { 1.0 };
        for c in 0..3 {
            row[c] = (flip * geometry.direction[r][c] * geometry.spacing[c]) as f32;
        }
        row[3] = (flip * geometry.origin[r]) as f32;
    }
    header.srow_x = rows[0];
    header.srow_y = rows[1];
    header.srow_z = rows[2];
    header.sform_code = SFORM_SCANNER_ANAT;
    header.qform_code = 0;
    header.pixdim[0] = 1.0;
    for axis in 0..3 {
        header.pixdim[axis + 1] = geometry.spacing[axis] as f32;
    }
    header.xyzt_units = UNITS_MM;
    if kind == VoxelKind::Label {
        header.intent_code = 1002;
    }
    header
}

fn geometry_from_header(header: &NiftiHeader) -> Geometry {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut geometry = Geometry::default();
        for c in 0..3 {
            let column: Vec<f64> = rows.iter().map(|row| f64::from(row[c])).collect();
            let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
            geometry.spacing[c] = if norm > 0.0 { norm } else { 1.0 };
            for r in 0..3 {
                let flip = if r < 2 { -1.0 } else { 1.0 };
                geometry.direction[r][c] = flip * column[r] / geometry.spacing[c];
            }
        }
        for r in 0..3 {
            let flip = if r < 2 { -1.0 } else { 1.0 };
            geometry.origin[r] = flip * f64::from(rows[r][3]);
        }
        return geometry;
    }

    let spacing = [1, 2, 3].map(|i| {
        let d = f64::from(header.pixdim[i]).abs();
        if d > 0.0 { d } else { 1.0 }
    });

    if header.qform_code > 0 {
        let (b, c, d) = (
            f64::from(header.quatern_b),
            f64::from(header.quatern_c),
            f64::from(header.quatern_d),
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let ras = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c) * qfac],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b) * qfac],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), (a * a + d * d - c * c - b * b) * qfac],
        ];
        let offset = [
            f64::from(header.quatern_x),
            f64::from(header.quatern_y),
            f64::from(header.quatern_z),
        ];
        let mut geometry = Geometry {
            spacing,
            ..Geometry::default()
        };
        for r in 0..3 {
            let flip = if r < 2 { -1.0 } else { 1.0 };
            geometry.origin[r] = flip * offset[r];
            for col in 0..3 {
                geometry.direction[r][col] = flip * ras[r][col];
            }
        }
        return geometry;
    }

    // Analyze-style header: RAS-aligned axes at the origin.
    Geometry {
        spacing,
        origin: [0.0; 3],
        direction: [[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]],
    }
}
