//! In-memory volumetric images.
//!
//! Voxels are stored as `[i, j, k]` (column, row, slice) and the geometry is
//! expressed in DICOM patient coordinates (LPS, millimetres).

use ndarray::Array3;

use crate::error::{Error, Result};

const GEOMETRY_TOLERANCE: f64 = 1e-4;

/// Whether voxels hold intensities or label values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelKind {
    Intensity,
    Label,
}

/// Physical placement of a voxel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    /// Columns are the unit vectors of the i, j and k axes.
    pub direction: [[f64; 3]; 3],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            spacing: [1.0; 3],
            origin: [0.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }
}

impl Geometry {
    /// Axis unit vector `axis` (0 = i, 1 = j, 2 = k).
    pub fn axis(&self, axis: usize) -> [f64; 3] {
        [
            self.direction[0][axis],
            self.direction[1][axis],
            self.direction[2][axis],
        ]
    }

    /// Maps a physical point to continuous voxel coordinates.
    ///
    /// The direction matrix is assumed orthonormal, so its transpose is used
    /// as the inverse.
    pub fn physical_to_index(&self, point: [f64; 3]) -> [f64; 3] {
        let delta = [
            point[0] - self.origin[0],
            point[1] - self.origin[1],
            point[2] - self.origin[2],
        ];
        let mut index = [0.0; 3];
        for (axis, slot) in index.iter_mut().enumerate() {
            let unit = self.axis(axis);
            let projected = unit[0] * delta[0] + unit[1] * delta[1] + unit[2] * delta[2];
            *slot = projected / self.spacing[axis];
        }
        index
    }

    /// Maps voxel coordinates to a physical point.
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let mut point = self.origin;
        for axis in 0..3 {
            let unit = self.axis(axis);
            let step = index[axis] * self.spacing[axis];
            for (coord, u) in point.iter_mut().zip(unit) {
                *coord += u * step;
            }
        }
        point
    }

    pub fn approx_eq(&self, other: &Geometry) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= GEOMETRY_TOLERANCE * a.abs().max(1.0);
        self.spacing.iter().zip(&other.spacing).all(|(a, b)| close(*a, *b))
            && self.origin.iter().zip(&other.origin).all(|(a, b)| close(*a, *b))
            && self
                .direction
                .iter()
                .flatten()
                .zip(other.direction.iter().flatten())
                .all(|(a, b)| close(*a, *b))
    }
}

/// A 3-D image with its geometry.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub geometry: Geometry,
    pub kind: VoxelKind,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: Geometry) -> Self {
        Self {
            data,
            geometry,
            kind: VoxelKind::Intensity,
        }
    }

    pub fn label(data: Array3<f32>, geometry: Geometry) -> Self {
        Self {
            data,
            geometry,
            kind: VoxelKind::Label,
        }
    }

    /// Empty label volume on the same grid as `self`.
    pub fn empty_label_like(&self) -> Self {
        Self::label(Array3::zeros(self.data.raw_dim()), self.geometry.clone())
    }

    /// Same grid and kind, different voxels.
    pub fn with_data(&self, data: Array3<f32>) -> Result<Self> {
        if data.dim() != self.data.dim() {
            return Err(Error::Geometry(format!(
                "replacement data has shape {:?}, expected {:?}",
                data.dim(),
                self.data.dim()
            )));
        }
        Ok(Self {
            data,
            geometry: self.geometry.clone(),
            kind: self.kind,
        })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Fails unless `other` shares this volume's shape and geometry.
    pub fn ensure_aligned(&self, other: &Volume) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::Geometry(format!(
                "shape {:?} does not match {:?}",
                other.shape(),
                self.shape()
            )));
        }
        if !self.geometry.approx_eq(&other.geometry) {
            return Err(Error::Geometry(format!(
                "{:?} does not match {:?}",
                other.geometry, self.geometry
            )));
        }
        Ok(())
    }
}
