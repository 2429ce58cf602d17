//! RTSTRUCT contour loading and rasterisation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use ndarray::Array2;
use regex::Regex;
use tracing::{debug, warn};

use crate::dicom_file::{self, floats, int, items, string};
use crate::error::{Error, Result};
use crate::volume::Volume;

/// Produces one mask per requested ROI key, on the grid of `reference`.
pub trait MaskLoader {
    fn load_masks(&self, rtstruct: &Path, reference: &Volume, rois: &RoiPatterns) -> Result<BTreeMap<String, Volume>>;
}

/// Ordered ROI keys, each with the name patterns that select it.
///
/// Patterns are case-insensitive and must match the whole ROI name.
#[derive(Debug, Clone)]
pub struct RoiPatterns {
    entries: Vec<(String, Vec<Regex>)>,
}

impl RoiPatterns {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with(mut self, key: &str, patterns: &[&str]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i)^(?:{p})$")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.entries.push((key.to_string(), compiled));
        Ok(self)
    }

    /// Parses `NAME=PATTERN[,PATTERN...]`; a bare `NAME` matches itself
    /// literally.
    pub fn parse(spec: &str) -> Result<Self> {
        let (key, patterns) = match spec.split_once('=') {
            Some((key, rest)) => (key.trim(), rest.split(',').map(str::trim).collect::<Vec<_>>()),
            None => (spec.trim(), Vec::new()),
        };
        if key.is_empty() {
            return Err(Error::RoiMapping(format!("missing ROI name in {spec:?}")));
        }
        if patterns.iter().any(|p| p.is_empty()) {
            return Err(Error::RoiMapping(format!("empty pattern in {spec:?}")));
        }
        let escaped = regex::escape(key);
        let patterns = if patterns.is_empty() { vec![escaped.as_str()] } else { patterns };
        Self::new().with(key, &patterns)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn first_key(&self) -> Option<&str> {
        self.keys().next()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn matching<'a>(&self, key: &str, names: &'a [RoiDefinition]) -> Option<&'a RoiDefinition> {
        let (_, patterns) = self.entries.iter().find(|(k, _)| k == key)?;
        names.iter().find(|roi| patterns.iter().any(|p| p.is_match(&roi.name)))
    }
}

impl Default for RoiPatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoiPatterns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(key, patterns)| {
                let patterns: Vec<&str> = patterns.iter().map(Regex::as_str).collect();
                format!("{key}={}", patterns.join(","))
            })
            .collect();
        f.write_str(&parts.join("; "))
    }
}

#[derive(Debug, Clone)]
struct RoiDefinition {
    number: i64,
    name: String,
}

/// Contour points of one planar polygon, in patient coordinates.
type Contour = Vec<[f64; 3]>;

/// Reads RTSTRUCT files and rasterises the selected ROI contours.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtstructLoader;

impl MaskLoader for RtstructLoader {
    fn load_masks(&self, rtstruct: &Path, reference: &Volume, rois: &RoiPatterns) -> Result<BTreeMap<String, Volume>> {
        let file = locate_rtstruct(rtstruct)?;
        let obj = dicom_file::open_full(&file)?;

        let definitions: Vec<RoiDefinition> = items(&obj, tags::STRUCTURE_SET_ROI_SEQUENCE)
            .iter()
            .filter_map(|item| {
                Some(RoiDefinition {
                    number: int(item, tags::ROI_NUMBER)?,
                    name: string(item, tags::ROI_NAME)?,
                })
            })
            .collect();

        let mut masks = BTreeMap::new();
        for key in rois.keys() {
            let roi = rois.matching(key, &definitions).ok_or_else(|| Error::MissingRoi {
                roi: key.to_string(),
                path: file.clone(),
            })?;
            let contours = contours_for(&obj, roi.number);
            if contours.is_empty() {
                warn!(roi = %roi.name, path = %file.display(), "ROI has no closed planar contours");
            }
            debug!(key, roi = %roi.name, contours = contours.len(), "rasterising ROI");
            masks.insert(key.to_string(), rasterize(&contours, reference));
        }
        Ok(masks)
    }
}

/// Accepts either the RTSTRUCT file itself or a folder holding it.
fn locate_rtstruct(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    for file in dicom_file::dicom_files_in(path)? {
        let header = dicom_file::open_header(&file)?;
        if string(&header, tags::MODALITY).as_deref() == Some("RTSTRUCT") {
            return Ok(file);
        }
    }
    Err(Error::EmptySeries(path.to_path_buf()))
}

fn contours_for(obj: &InMemDicomObject, roi_number: i64) -> Vec<Contour> {
    items(obj, tags::ROI_CONTOUR_SEQUENCE)
        .iter()
        .filter(|item| int(item, tags::REFERENCED_ROI_NUMBER) == Some(roi_number))
        .flat_map(|item| items(item, tags::CONTOUR_SEQUENCE))
        .filter(|contour| {
            string(contour, tags::CONTOUR_GEOMETRIC_TYPE).map_or(true, |kind| kind == "CLOSED_PLANAR")
        })
        .filter_map(|contour| floats(contour, tags::CONTOUR_DATA))
        .map(|data| data.chunks_exact(3).map(|p| [p[0], p[1], p[2]]).collect::<Contour>())
        .filter(|points| points.len() >= 3)
        .collect()
}

/// Burns contours into a label volume on the reference grid.
///
/// Each contour lands on its nearest slice. A voxel centre is inside when an
/// odd number of contours on that slice enclose it, so inner contours cut
/// holes.
pub(crate) fn rasterize(contours: &[Contour], reference: &Volume) -> Volume {
    let mut mask = reference.empty_label_like();
    let (ni, nj, nk) = mask.shape();

    for contour in contours {
        let projected: Vec<[f64; 3]> = contour
            .iter()
            .map(|&point| reference.geometry.physical_to_index(point))
            .collect();
        let k = (projected.iter().map(|p| p[2]).sum::<f64>() / projected.len() as f64).round();
        if k < 0.0 || k >= nk as f64 {
            continue;
        }
        let polygon: Vec<(f64, f64)> = projected.iter().map(|p| (p[0], p[1])).collect();
        let inside = fill_polygon(&polygon, ni, nj);
        let mut plane = mask.data.index_axis_mut(ndarray::Axis(2), k as usize);
        for ((i, j), hit) in inside.indexed_iter() {
            if *hit {
                plane[[i, j]] = 1.0 - plane[[i, j]];
            }
        }
    }
    mask
}

/// Even-odd scanline fill, sampled at voxel centres.
fn fill_polygon(polygon: &[(f64, f64)], ni: usize, nj: usize) -> Array2<bool> {
    let mut inside = Array2::from_elem((ni, nj), false);
    let mut crossings = Vec::new();

    for j in 0..nj {
        let y = j as f64;
        crossings.clear();
        for (n, &(x0, y0)) in polygon.iter().enumerate() {
            let (x1, y1) = polygon[(n + 1) % polygon.len()];
            if (y0 <= y) != (y1 <= y) {
                crossings.push(x0 + (y - y0) * (x1 - x0) / (y1 - y0));
            }
        }
        crossings.sort_by(f64::total_cmp);

        for span in crossings.chunks_exact(2) {
            let start = span[0].ceil().max(0.0);
            let end = span[1].floor().min(ni as f64 - 1.0);
            if start > end {
                continue;
            }
            for i in start as usize..=end as usize {
                inside[[i, j]] = true;
            }
        }
    }
    inside
}
