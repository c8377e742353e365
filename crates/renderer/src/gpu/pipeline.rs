use std::collections::HashMap;

use crate::compile::{compile_fragment_shader, compile_vertex_shader};

use super::{ProgramKind, QuadVertex};

/// Bind group layouts shared by every quad pipeline: group 0 carries the
/// per-draw texture matrix, group 1 the colour and alpha textures.
pub(crate) struct PipelineLayouts {
    pub params_layout: wgpu::BindGroupLayout,
    pub texture_layout: wgpu::BindGroupLayout,
    pub sampler: wgpu::Sampler,
    layout: wgpu::PipelineLayout,
}

impl PipelineLayouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let params_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("quad params layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("quad texture layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("quad pipeline layout"),
            bind_group_layouts: &[&params_layout, &texture_layout],
            push_constant_ranges: &[],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("quad sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        Self {
            params_layout,
            texture_layout,
            sampler,
            layout,
        }
    }
}

/// Render pipelines keyed by program and colour target format. Programs
/// draw both into `Rgba8Unorm` targets and onto the display surface, whose
/// format the adapter chooses.
#[derive(Default)]
pub(crate) struct PipelineCache {
    pipelines: HashMap<(ProgramKind, wgpu::TextureFormat), wgpu::RenderPipeline>,
}

impl PipelineCache {
    pub fn get_or_create(
        &mut self,
        device: &wgpu::Device,
        layouts: &PipelineLayouts,
        kind: ProgramKind,
        format: wgpu::TextureFormat,
    ) -> &wgpu::RenderPipeline {
        self.pipelines
            .entry((kind, format))
            .or_insert_with(|| create_pipeline(device, layouts, kind, format))
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    layouts: &PipelineLayouts,
    kind: ProgramKind,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    tracing::debug!(program = ?kind, ?format, "creating quad pipeline");
    let vertex_module = compile_vertex_shader(device, kind);
    let fragment_module = compile_fragment_shader(device, kind);
    let attributes = wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(kind.cache_key()),
        layout: Some(&layouts.layout),
        vertex: wgpu::VertexState {
            module: &vertex_module,
            entry_point: Some("main"),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            }],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &fragment_module,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}
