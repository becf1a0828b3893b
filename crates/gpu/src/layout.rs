//! The fixed root signature layout shared by every backend.
//!
//! Graphics root parameters:
//!
//! | parameter     | contents                                         |
//! |---------------|--------------------------------------------------|
//! | `3 * s + 0`   | constant buffer table for graphics stage `s`     |
//! | `3 * s + 1`   | shader resource table for graphics stage `s`     |
//! | `3 * s + 2`   | sampler table for graphics stage `s`             |
//! | `15`          | unordered access table (pixel stage)             |
//! | `16 + n`      | per-draw root constant buffer `n`, all stages    |
//!
//! Compute root parameters are the same four tables for the compute stage
//! at `0..4`, followed by the per-draw root constant buffers.

use crate::types::{BindingFamily, ShaderStage};

/// Constant buffer bind points below this are staged through descriptor
/// tables. Bind points at or above it are per-draw root constant buffers.
pub const TABLE_CONSTANT_BUFFER_SLOTS: u32 = 10;

/// The number of root constant buffer slots, starting at register
/// `TABLE_CONSTANT_BUFFER_SLOTS`.
pub const PER_DRAW_CONSTANT_BUFFER_SLOTS: u32 = 4;

pub const GRAPHICS_UAV_TABLE_PARAMETER: u32 = 15;
pub const GRAPHICS_PER_DRAW_PARAMETER_BASE: u32 = 16;
pub const GRAPHICS_PARAMETER_COUNT: u32 =
    GRAPHICS_PER_DRAW_PARAMETER_BASE + PER_DRAW_CONSTANT_BUFFER_SLOTS;

pub const COMPUTE_PER_DRAW_PARAMETER_BASE: u32 = 4;
pub const COMPUTE_PARAMETER_COUNT: u32 =
    COMPUTE_PER_DRAW_PARAMETER_BASE + PER_DRAW_CONSTANT_BUFFER_SLOTS;

/// Whether a stage is driven through the graphics or compute root signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pipe {
    Graphics,
    Compute,
}

impl Pipe {
    #[must_use]
    pub fn of(stage: ShaderStage) -> Self {
        if stage == ShaderStage::Compute {
            Self::Compute
        } else {
            Self::Graphics
        }
    }
}

/// The root parameter a stage's binding table is attached to, or `None` if
/// the layout has no table for that combination. Only the pixel and compute
/// stages have unordered access tables.
#[must_use]
pub fn table_parameter(stage: ShaderStage, family: BindingFamily) -> Option<u32> {
    let family_offset = match family {
        BindingFamily::ConstantBuffer => 0,
        BindingFamily::ShaderResource => 1,
        BindingFamily::Sampler => 2,
        BindingFamily::UnorderedAccess => 3,
    };

    match (stage, family) {
        (ShaderStage::Compute, _) => Some(family_offset),
        (ShaderStage::Pixel, BindingFamily::UnorderedAccess) => Some(GRAPHICS_UAV_TABLE_PARAMETER),
        (_, BindingFamily::UnorderedAccess) => None,
        (stage, _) => Some(3 * stage.index() as u32 + family_offset),
    }
}

/// The root parameter of per-draw constant buffer slot `slot`.
#[must_use]
pub fn per_draw_parameter(pipe: Pipe, slot: u32) -> u32 {
    debug_assert!(slot < PER_DRAW_CONSTANT_BUFFER_SLOTS);
    match pipe {
        Pipe::Graphics => GRAPHICS_PER_DRAW_PARAMETER_BASE + slot,
        Pipe::Compute => COMPUTE_PER_DRAW_PARAMETER_BASE + slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_tables() {
        assert_eq!(table_parameter(ShaderStage::Vertex, BindingFamily::ConstantBuffer), Some(0));
        assert_eq!(table_parameter(ShaderStage::Vertex, BindingFamily::Sampler), Some(2));
        assert_eq!(table_parameter(ShaderStage::Pixel, BindingFamily::ShaderResource), Some(13));
        assert_eq!(table_parameter(ShaderStage::Pixel, BindingFamily::UnorderedAccess), Some(15));
        assert_eq!(table_parameter(ShaderStage::Hull, BindingFamily::UnorderedAccess), None);
    }

    #[test]
    fn compute_tables() {
        assert_eq!(table_parameter(ShaderStage::Compute, BindingFamily::ConstantBuffer), Some(0));
        assert_eq!(table_parameter(ShaderStage::Compute, BindingFamily::UnorderedAccess), Some(3));
        assert_eq!(per_draw_parameter(Pipe::Compute, 0), 4);
        assert_eq!(per_draw_parameter(Pipe::Graphics, 3), 19);
    }
}
