use std::borrow::Cow;

use wgpu::naga::ShaderStage;

use crate::gpu::ProgramKind;

/// Compiles the quad vertex shader for `kind`. Decoder textures keep their
/// first row at `v = 0` like GL; rendered targets store rows top-down, so
/// every non-external colour lookup is flipped here.
pub(crate) fn compile_vertex_shader(device: &wgpu::Device, kind: ProgramKind) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(kind.cache_key()),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(vertex_source(kind)),
            stage: ShaderStage::Vertex,
            defines: &[],
        },
    })
}

pub(crate) fn compile_fragment_shader(
    device: &wgpu::Device,
    kind: ProgramKind,
) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(kind.cache_key()),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(fragment_source(kind)),
            stage: ShaderStage::Fragment,
            defines: &[],
        },
    })
}

fn vertex_source(kind: ProgramKind) -> String {
    let mut source = String::from(VERSION);
    if !kind.is_external() {
        source.push_str("#define FLIP_COLOR\n");
    }
    source.push_str(VERTEX_BODY);
    source
}

fn fragment_source(kind: ProgramKind) -> String {
    let mut source = String::from(VERSION);
    if kind.has_alpha() {
        source.push_str("#define WITH_ALPHA\n");
    }
    source.push_str(FRAGMENT_BODY);
    source
}

const VERSION: &str = "#version 450\n";

/// Must match `QuadParams` in `gpu::backend`.
const VERTEX_BODY: &str = r"
layout(location = 0) in vec2 a_position;
layout(location = 1) in vec2 a_uv;
layout(location = 0) out vec2 v_color_uv;
layout(location = 1) out vec2 v_alpha_uv;

layout(std140, set = 0, binding = 0) uniform QuadParams {
    mat4 texture_matrix;
    vec4 placement;
} params;

void main() {
    vec2 uv = (params.texture_matrix * vec4(a_uv, 0.0, 1.0)).xy;
#ifdef FLIP_COLOR
    uv.y = 1.0 - uv.y;
#endif
    v_color_uv = uv;
    v_alpha_uv = vec2(a_uv.x, 1.0 - a_uv.y);
    gl_Position = vec4(a_position * params.placement.xy + params.placement.zw, 0.0, 1.0);
}
";

const FRAGMENT_BODY: &str = r"
layout(location = 0) in vec2 v_color_uv;
layout(location = 1) in vec2 v_alpha_uv;
layout(location = 0) out vec4 out_color;

layout(set = 1, binding = 0) uniform texture2D color_texture;
layout(set = 1, binding = 1) uniform texture2D alpha_texture;
layout(set = 1, binding = 2) uniform sampler quad_sampler;

void main() {
    vec4 color = texture(sampler2D(color_texture, quad_sampler), v_color_uv);
#ifdef WITH_ALPHA
    color.a = texture(sampler2D(alpha_texture, quad_sampler), v_alpha_uv).r;
#endif
    out_color = color;
}
";
