use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;

/// Extents of a tensor, outermost first. Extents may be zero.
pub type Shape = SmallVec<[u64; 8]>;

/// Indices into a [Shape].
pub type Axes = SmallVec<[usize; 8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Float16,
    Float32,
    Bfloat16,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Uint16 | Dtype::Sint16 | Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Uint32 | Dtype::Sint32 | Dtype::Float32 => 4,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Bfloat16 => write!(f, "bf16"),
        }
    }
}

/// The execution strategy chosen for a reduction.
///
/// The discriminants are the ordinals packed into dispatch keys and must not be reordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Variant {
    Normal = 0,
    /// Lanes reduce disjoint slices of the reduced volume and accumulate into the output.
    Atomic = 1,
    /// Lanes reduce disjoint slices into a workspace, then a final pass combines them.
    Group = 2,
    /// The innermost axis is padded up to the alignment quantum on-chip.
    Padded = 3,
    /// Rows are transposed on-chip so an unaligned innermost reduction becomes aligned.
    Transposed = 4,
}

impl Variant {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}
