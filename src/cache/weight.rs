//! Tile weight model: the byte cost of a tile, used for capacity accounting.
//!
//! A tile's weight depends only on its pixel element kind and its
//! dimensions: `row_stride_elements * height * bytes_per_element`.

use std::fmt;
use std::mem::size_of;
use std::str::FromStr;

use bytemuck::Pod;
use half::f16;
use serde::{Deserialize, Serialize};

use crate::cache::tile::TileError;

/// Primitive element kind of one pixel sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    U8,
    I8,
    U16,
    I16,
    F16,
    U32,
    I32,
    F32,
    U64,
    I64,
    F64,
}

impl ElementKind {
    pub const ALL: [ElementKind; 11] = [
        ElementKind::U8,
        ElementKind::I8,
        ElementKind::U16,
        ElementKind::I16,
        ElementKind::F16,
        ElementKind::U32,
        ElementKind::I32,
        ElementKind::F32,
        ElementKind::U64,
        ElementKind::I64,
        ElementKind::F64,
    ];

    /// Size of one sample in bytes.
    pub fn bytes_per_element(&self) -> usize {
        match self {
            ElementKind::U8 => size_of::<u8>(),
            ElementKind::I8 => size_of::<i8>(),
            ElementKind::U16 => size_of::<u16>(),
            ElementKind::I16 => size_of::<i16>(),
            ElementKind::F16 => size_of::<f16>(),
            ElementKind::U32 => size_of::<u32>(),
            ElementKind::I32 => size_of::<i32>(),
            ElementKind::F32 => size_of::<f32>(),
            ElementKind::U64 => size_of::<u64>(),
            ElementKind::I64 => size_of::<i64>(),
            ElementKind::F64 => size_of::<f64>(),
        }
    }

    /// Stable numeric code, written into spill file headers.
    pub fn code(&self) -> u8 {
        match self {
            ElementKind::U8 => 0,
            ElementKind::I8 => 1,
            ElementKind::U16 => 2,
            ElementKind::I16 => 3,
            ElementKind::F16 => 4,
            ElementKind::U32 => 5,
            ElementKind::I32 => 6,
            ElementKind::F32 => 7,
            ElementKind::U64 => 8,
            ElementKind::I64 => 9,
            ElementKind::F64 => 10,
        }
    }

    /// Inverse of [`ElementKind::code`].
    pub fn from_code(code: u8) -> Result<Self, TileError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.code() == code)
            .ok_or_else(|| TileError::UnsupportedElementKind(code.to_string()))
    }

    fn name(&self) -> &'static str {
        match self {
            ElementKind::U8 => "u8",
            ElementKind::I8 => "i8",
            ElementKind::U16 => "u16",
            ElementKind::I16 => "i16",
            ElementKind::F16 => "f16",
            ElementKind::U32 => "u32",
            ElementKind::I32 => "i32",
            ElementKind::F32 => "f32",
            ElementKind::U64 => "u64",
            ElementKind::I64 => "i64",
            ElementKind::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementKind {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == lower)
            .ok_or_else(|| TileError::UnsupportedElementKind(s.to_string()))
    }
}

/// A Rust type that can be stored as a pixel sample.
pub trait Sample: Pod {
    const KIND: ElementKind;
}

macro_rules! impl_sample {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl Sample for $ty {
            const KIND: ElementKind = ElementKind::$kind;
        })*
    };
}

impl_sample! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    f16 => F16,
    u32 => U32,
    i32 => I32,
    f32 => F32,
    u64 => U64,
    i64 => I64,
    f64 => F64,
}

/// Byte cost of a tile.
///
/// ```text
/// weight = row_stride_elements * height * bytes_per_element
/// ```
pub fn weight(kind: ElementKind, row_stride_elements: usize, height: usize) -> u64 {
    row_stride_elements as u64 * height as u64 * kind.bytes_per_element() as u64
}
