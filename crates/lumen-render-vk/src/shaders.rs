// SPDX-License-Identifier: CEPL-1.0
//! SPIR-V for the mesh pipeline, compiled from `shaders/` by the build script.

use std::io::Cursor;

use lumen_render::ShaderCode;

use crate::error::{VkError, VkResult};

pub const MESH_VERT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
pub const MESH_FRAG_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));

/// Reads SPIR-V bytes into words, checking size and magic number.
pub fn spirv_words(bytes: &[u8]) -> VkResult<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|_| VkError::InvalidShader("not a SPIR-V module"))
}

/// The built-in mesh shaders.
pub fn builtin() -> VkResult<ShaderCode> {
    Ok(ShaderCode {
        vertex: spirv_words(MESH_VERT_SPV)?,
        fragment: spirv_words(MESH_FRAG_SPV)?,
    })
}
