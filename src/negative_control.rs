//! Negative-control image synthesis.
//!
//! A negative control keeps the geometry of the CT but destroys the
//! information inside (or outside) the region of interest, either by
//! permuting voxels or by drawing new values. Every variant is a pure
//! function of the image, the mask, the variant and the seed.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::volume::Volume;

/// How replacement voxel values are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Permute the existing values.
    Shuffled,
    /// Uniform draws between the region's minimum and maximum.
    Randomized,
    /// Draws with replacement from the region's existing values.
    RandomizedSampled,
}

/// Which voxels are replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Full,
    Roi,
    NonRoi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegativeControl {
    pub method: Method,
    pub region: Region,
}

impl NegativeControl {
    pub const ALL: [NegativeControl; 9] = {
        use Method::*;
        use Region::*;
        [
            NegativeControl::new(Shuffled, Full),
            NegativeControl::new(Shuffled, Roi),
            NegativeControl::new(Shuffled, NonRoi),
            NegativeControl::new(Randomized, Full),
            NegativeControl::new(Randomized, Roi),
            NegativeControl::new(Randomized, NonRoi),
            NegativeControl::new(RandomizedSampled, Full),
            NegativeControl::new(RandomizedSampled, Roi),
            NegativeControl::new(RandomizedSampled, NonRoi),
        ]
    };

    pub const fn new(method: Method, region: Region) -> Self {
        Self { method, region }
    }
}

impl fmt::Display for NegativeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = match self.method {
            Method::Shuffled => "shuffled",
            Method::Randomized => "randomized",
            Method::RandomizedSampled => "randomized_sampled",
        };
        let region = match self.region {
            Region::Full => "full",
            Region::Roi => "roi",
            Region::NonRoi => "non_roi",
        };
        write!(f, "{method}_{region}")
    }
}

impl FromStr for NegativeControl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        NegativeControl::ALL
            .into_iter()
            .find(|control| control.to_string() == normalized)
            .ok_or_else(|| Error::UnknownNegativeControl(s.to_string()))
    }
}

/// Builds a negative-control image from a CT and its aligned mask.
pub trait NegativeControlSynthesizer {
    fn synthesize(&self, image: &Volume, mask: &Volume, seed: u64, control: NegativeControl) -> Result<Volume>;
}

/// Voxel-permutation and random-draw synthesizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoxelSynthesizer;

impl NegativeControlSynthesizer for VoxelSynthesizer {
    fn synthesize(&self, image: &Volume, mask: &Volume, seed: u64, control: NegativeControl) -> Result<Volume> {
        image.ensure_aligned(mask)?;

        let selected: Vec<usize> = mask
            .data
            .iter()
            .enumerate()
            .filter(|(_, label)| match control.region {
                Region::Full => true,
                Region::Roi => **label > 0.0,
                Region::NonRoi => **label <= 0.0,
            })
            .map(|(n, _)| n)
            .collect();

        let mut voxels: Vec<f32> = image.data.iter().copied().collect();
        let mut rng = StdRng::seed_from_u64(seed);
        let originals: Vec<f32> = selected.iter().map(|&n| voxels[n]).collect();

        let replacements: Vec<f32> = match control.method {
            Method::Shuffled => {
                let mut values = originals;
                values.shuffle(&mut rng);
                values
            }
            Method::Randomized => {
                let (lo, hi) = originals
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                originals
                    .iter()
                    .map(|_| if lo < hi { rng.gen_range(lo..=hi) } else { lo })
                    .collect()
            }
            Method::RandomizedSampled => originals
                .iter()
                .map(|_| originals[rng.gen_range(0..originals.len())])
                .collect(),
        };

        for (&n, value) in selected.iter().zip(replacements) {
            voxels[n] = value;
        }

        let data = ndarray::Array3::from_shape_vec(image.data.raw_dim(), voxels)
            .map_err(|e| Error::Geometry(e.to_string()))?;
        image.with_data(data)
    }
}
