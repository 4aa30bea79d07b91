//! Shader data: persistent GPU buffers owned by the layer and exposed to
//! instrumented shaders as module-scope variables.

/// Host-side identifier of a shader data resource.
pub type ShaderDataId = u32;

pub const INVALID_SHADER_DATA_ID: ShaderDataId = !0;

/// Creation info for a shader data buffer. Element width is 32 bits; the
/// validation features only ever store packed words.
#[derive(Copy, Clone, Debug)]
pub struct ShaderDataBufferInfo {
    pub element_count: u32,
}

/// Owner of shader data buffers. The device backend implements this; the
/// features and the texel allocator create their persistent buffers through
/// it at install time.
pub trait ShaderDataHost: Send + Sync {
    fn create_buffer(&self, info: ShaderDataBufferInfo) -> ShaderDataId;

    fn destroy_buffer(&self, id: ShaderDataId);

    /// Direct host access for the pump and tests; returns a copy of the
    /// buffer words.
    fn read_buffer(&self, id: ShaderDataId) -> Vec<u32>;
}
