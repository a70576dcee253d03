// SPDX-License-Identifier: CEPL-1.0
//! Device copies of the scene handed over at initialization.

use ash::vk;
use lumen_render::{MeshData, SceneDesc};
use tracing::info;

use crate::error::{VkError, VkResult};
use crate::flags::BufferUsage;
use crate::memory::DeviceBuffer;
use crate::upload::{Texture, UploadPipeline};

#[derive(Debug)]
pub struct MeshBuffers {
    vertices: DeviceBuffer,
    indices: DeviceBuffer,
    index_count: u32,
}

impl MeshBuffers {
    pub fn upload(uploads: &UploadPipeline, mesh: &MeshData) -> VkResult<Self> {
        if mesh.indices.is_empty() || mesh.vertices.is_empty() {
            return Err(VkError::EmptyUpload);
        }
        let vertices =
            uploads.stage_upload(bytemuck::cast_slice(&mesh.vertices), BufferUsage::VERTEX)?;
        let indices =
            uploads.stage_upload(bytemuck::cast_slice(&mesh.indices), BufferUsage::INDEX)?;
        Ok(Self {
            vertices,
            indices,
            index_count: mesh.indices.len() as u32,
        })
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.raw()
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.raw()
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

#[derive(Debug)]
pub struct SceneResources {
    pub mesh: MeshBuffers,
    pub texture: Texture,
}

impl SceneResources {
    pub fn upload(uploads: &UploadPipeline, scene: &SceneDesc) -> VkResult<Self> {
        let mesh = MeshBuffers::upload(uploads, &scene.mesh)?;
        let texture = uploads.upload_texture(&scene.texture)?;
        info!(
            "vk: scene uploaded ({} vertices, {} indices, {}x{} texture)",
            scene.mesh.vertices.len(),
            scene.mesh.indices.len(),
            scene.texture.width,
            scene.texture.height
        );
        Ok(Self { mesh, texture })
    }
}
