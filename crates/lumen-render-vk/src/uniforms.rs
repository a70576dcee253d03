// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

const DEGREES_PER_SECOND: f32 = 90.0;
const FOV_Y_DEGREES: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 100.0;

/// Per-image uniform block, column-major, laid out as three `mat4` in std140.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformMatrices {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
}

impl UniformMatrices {
    pub const SIZE: vk::DeviceSize = std::mem::size_of::<Self>() as vk::DeviceSize;

    /// Spinning model seen from (0, 2, 2), projected for `extent`.
    pub fn at(elapsed_secs: f32, extent: vk::Extent2D) -> Self {
        let model = Mat4::from_rotation_z((elapsed_secs * DEGREES_PER_SECOND).to_radians());
        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut projection =
            Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR);
        // Clip space Y points down in Vulkan.
        projection.y_axis.y *= -1.0;

        Self {
            model: model.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            projection: projection.to_cols_array_2d(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
