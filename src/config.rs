//! Compile-time tunables.

use std::ffi::CStr;

use ash::vk;

pub const WINDOW_TITLE: &str = "vkstage";
pub const WINDOW_WIDTH: u32 = 800;
pub const WINDOW_HEIGHT: u32 = 600;

/// Number of instances drawn by the single indexed draw call. Must match the
/// `models` array length in `assets/shaders/shader.vert`.
pub const INSTANCE_COUNT: usize = 10;

/// Requested rasterization sample count; clamped to what the device supports.
pub const MSAA_SAMPLES: vk::SampleCountFlags = vk::SampleCountFlags::TYPE_4;

pub const DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

pub const VERTEX_SHADER_PATH: &str = "assets/shaders/shader.vert.spv";
pub const FRAGMENT_SHADER_PATH: &str = "assets/shaders/shader.frag.spv";
pub const TEXTURE_PATH: &str = "assets/textures/texture.png";
pub const MODEL_PATH: &str = "assets/models/model.obj";

//--------------------------------------------------------------------------------------------------
// Camera and animation
//--------------------------------------------------------------------------------------------------

pub const CAMERA_EYE: [f32; 3] = [5.0, 5.0, 5.0];
pub const CAMERA_TARGET: [f32; 3] = [0.0, -10.0, 0.0];
pub const FOV_Y_DEGREES: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 100.0;
/// Vertical distance between consecutive instances.
pub const INSTANCE_SPACING: f32 = -2.5;
pub const ROTATION_DEGREES_PER_SECOND: f32 = 45.0;
