use ndarray::Array3;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// set up enums and structs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    X,
    Y,
    Z,
}

impl Direction {
    pub fn to_usize(&self) -> usize {
        match self {
            Direction::X => 0,
            Direction::Y => 1,
            Direction::Z => 2,
        }
    }

    pub fn from_usize(val: usize) -> Result<Self, Error> {
        match val {
            0 => Ok(Direction::X),
            1 => Ok(Direction::Y),
            2 => Ok(Direction::Z),
            _ => Err(Error::InvalidArgument(format!(
                "spatial axis must be 0, 1 or 2, got {val}"
            ))),
        }
    }

    /// Unit mask with a 1 on this axis, e.g. `[0.0, 1.0, 0.0]` for Y.
    pub fn mask(&self) -> [f64; 3] {
        let mut mask = [0.0; 3];
        mask[self.to_usize()] = 1.0;
        mask
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::X => write!(f, "0"),
            Direction::Y => write!(f, "1"),
            Direction::Z => write!(f, "2"),
        }
    }
}

/// Declared phase-encoding direction of an EPI acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PhaseEncoding {
    Ap,
    Pa,
    Lr,
    Rl,
    Si,
    Is,
}

impl PhaseEncoding {
    /// The only spatial axis along which susceptibility distortion is corrected.
    pub fn axis(&self) -> Direction {
        match self {
            PhaseEncoding::Ap | PhaseEncoding::Pa => Direction::Y,
            PhaseEncoding::Lr | PhaseEncoding::Rl => Direction::X,
            PhaseEncoding::Si | PhaseEncoding::Is => Direction::Z,
        }
    }
}

impl FromStr for PhaseEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ap" => Ok(PhaseEncoding::Ap),
            "pa" => Ok(PhaseEncoding::Pa),
            "lr" => Ok(PhaseEncoding::Lr),
            "rl" => Ok(PhaseEncoding::Rl),
            "si" => Ok(PhaseEncoding::Si),
            "is" => Ok(PhaseEncoding::Is),
            other => Err(Error::InvalidArgument(format!(
                "unknown phase encoding direction '{other}'"
            ))),
        }
    }
}

/// One 3D volume cut out of a series, remembering where it came from.
#[derive(Debug, Clone)]
pub struct Vol3D {
    pub vol: Array3<f64>,
    pub index: usize,
}
impl Vol3D {
    pub fn new(vol: Array3<f64>, index: usize) -> Self {
        Self { vol, index }
    }
}
