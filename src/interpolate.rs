//! Interpolation modes and voxel-space sampling.

use std::fmt;

use ndarray::ArrayView3;

/// Interpolation requested from a transform application.
///
/// Label volumes (segmentations, parcellations) must be warped with a
/// label-preserving mode; nothing here enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Interpolation {
    #[default]
    Linear,
    NearestNeighbor,
    GenericLabel,
    MultiLabel,
    Bspline,
    CosineWindowedSinc,
    HammingWindowedSinc,
    LanczosWindowedSinc,
    Gaussian,
}

impl Interpolation {
    /// Token understood by the external apply-operator's `-n` flag.
    pub fn ants_token(&self) -> &'static str {
        match self {
            Interpolation::Linear => "Linear",
            Interpolation::NearestNeighbor => "NearestNeighbor",
            Interpolation::GenericLabel => "GenericLabel",
            Interpolation::MultiLabel => "MultiLabel",
            Interpolation::Bspline => "BSpline",
            Interpolation::CosineWindowedSinc => "CosineWindowedSinc",
            Interpolation::HammingWindowedSinc => "HammingWindowedSinc",
            Interpolation::LanczosWindowedSinc => "LanczosWindowedSinc",
            Interpolation::Gaussian => "Gaussian",
        }
    }

    pub fn is_label_preserving(&self) -> bool {
        matches!(
            self,
            Interpolation::NearestNeighbor | Interpolation::GenericLabel | Interpolation::MultiLabel
        )
    }

    /// The in-process sampler for this mode, if there is one.
    pub fn native_method(&self) -> Option<Method> {
        match self {
            Interpolation::Linear => Some(Method::Linear),
            Interpolation::NearestNeighbor
            | Interpolation::GenericLabel
            | Interpolation::MultiLabel => Some(Method::Nearest),
            _ => None,
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ants_token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Linear,
    Nearest,
}

/// What to do with coordinates outside the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Boundary {
    /// Clamp into range, repeating edge voxels.
    Clamp,
    /// Return a constant for points further than half a voxel outside.
    Constant(f64),
}

/// Samples `vol` at continuous voxel coordinate `p`.
pub fn sample(vol: &ArrayView3<f64>, p: [f64; 3], method: Method, boundary: Boundary) -> f64 {
    let shape = vol.shape();
    let mut q = p;
    for a in 0..3 {
        let max = (shape[a] as f64 - 1.0).max(0.0);
        if let Boundary::Constant(fill) = boundary {
            if !q[a].is_finite() || q[a] < -0.5 || q[a] > max + 0.5 {
                return fill;
            }
        }
        q[a] = q[a].clamp(0.0, max);
    }
    match method {
        Method::Nearest => vol[[
            q[0].round() as usize,
            q[1].round() as usize,
            q[2].round() as usize,
        ]],
        Method::Linear => trilinear(vol, q),
    }
}

// q must already be inside the grid
fn trilinear(vol: &ArrayView3<f64>, q: [f64; 3]) -> f64 {
    let shape = vol.shape();
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut w = [0.0f64; 3];
    for a in 0..3 {
        let f = q[a].floor();
        lo[a] = f as usize;
        hi[a] = (lo[a] + 1).min(shape[a] - 1);
        w[a] = q[a] - f;
    }
    let mut acc = 0.0;
    for (dx, wx) in [(lo[0], 1.0 - w[0]), (hi[0], w[0])] {
        if wx == 0.0 {
            continue;
        }
        for (dy, wy) in [(lo[1], 1.0 - w[1]), (hi[1], w[1])] {
            if wy == 0.0 {
                continue;
            }
            for (dz, wz) in [(lo[2], 1.0 - w[2]), (hi[2], w[2])] {
                if wz == 0.0 {
                    continue;
                }
                acc += wx * wy * wz * vol[[dx, dy, dz]];
            }
        }
    }
    acc
}
