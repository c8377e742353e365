use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Format of off-screen targets, decoder textures and the headless display.
pub(crate) const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub(crate) struct PresentSurface {
    pub surface: wgpu::Surface<'static>,
    pub config: wgpu::SurfaceConfiguration,
}

pub(crate) struct GpuContext {
    pub _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub surface: Option<PresentSurface>,
    pub size: (u32, u32),
    pub display_format: wgpu::TextureFormat,
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    /// Device without a window; the display is an off-screen texture.
    pub(crate) fn headless(width: u32, height: u32) -> Result<Self> {
        let instance = create_instance();
        let (device, queue) = request_device(&instance, None)?;
        let lost = watch_device(&device);
        Ok(Self {
            _instance: instance,
            device,
            queue,
            surface: None,
            size: (width.max(1), height.max(1)),
            display_format: OFFSCREEN_FORMAT,
            lost,
        })
    }

    /// Device presenting to the window behind `target`.
    pub(crate) fn with_surface<T>(target: &T, width: u32, height: u32) -> Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let instance = create_instance();
        let window_handle = target
            .window_handle()
            .map_err(|err| anyhow!("failed to acquire window handle: {err}"))?;
        let display_handle = target
            .display_handle()
            .map_err(|err| anyhow!("failed to acquire display handle: {err}"))?;

        // SAFETY: the caller keeps the window alive for as long as the
        // backend built on this context.
        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: display_handle.as_raw(),
                raw_window_handle: window_handle.as_raw(),
            })
        }
        .context("failed to create rendering surface")?;

        let adapter = request_adapter(&instance, Some(&surface))?;
        let (device, queue) = open_device(&adapter)?;
        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|format| !format.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| anyhow!("surface reports no usable formats"))?;
        let present_mode = if caps.present_modes.contains(&wgpu::PresentMode::Fifo) {
            wgpu::PresentMode::Fifo
        } else {
            caps.present_modes
                .first()
                .copied()
                .ok_or_else(|| anyhow!("surface reports no present modes"))?
        };
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let size = (width.max(1), height.max(1));
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.0,
            height: size.1,
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        tracing::debug!(?format, ?present_mode, width = size.0, height = size.1, "configured surface");

        let lost = watch_device(&device);
        Ok(Self {
            _instance: instance,
            device,
            queue,
            surface: Some(PresentSurface { surface, config }),
            size,
            display_format: format,
            lost,
        })
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.size = (width, height);
        if let Some(present) = self.surface.as_mut() {
            present.config.width = width;
            present.config.height = height;
            present.surface.configure(&self.device, &present.config);
        }
    }

    /// Reconfigures the surface after it went stale.
    pub(crate) fn reconfigure(&self) {
        if let Some(present) = self.surface.as_ref() {
            present.surface.configure(&self.device, &present.config);
        }
    }
}

fn create_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: wgpu::InstanceFlags::default(),
        memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
        backend_options: wgpu::BackendOptions::default(),
    })
}

fn request_adapter(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'static>>,
) -> Result<wgpu::Adapter> {
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::LowPower,
        compatible_surface: surface,
        force_fallback_adapter: false,
    }))
    .context("failed to find a suitable GPU adapter")?;
    let info = adapter.get_info();
    tracing::debug!(name = %info.name, backend = ?info.backend, device_type = ?info.device_type, "selected GPU adapter");
    Ok(adapter)
}

fn request_device(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'static>>,
) -> Result<(wgpu::Device, wgpu::Queue)> {
    let adapter = request_adapter(instance, surface)?;
    open_device(&adapter)
}

fn open_device(adapter: &wgpu::Adapter) -> Result<(wgpu::Device, wgpu::Queue)> {
    pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("heif viewer device"),
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
        memory_hints: wgpu::MemoryHints::MemoryUsage,
        trace: wgpu::Trace::default(),
    }))
    .context("failed to create GPU device")
}

fn watch_device(device: &wgpu::Device) -> Arc<AtomicBool> {
    let lost = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&lost);
    device.set_device_lost_callback(move |reason, message| {
        tracing::warn!(?reason, %message, "GPU device lost");
        flag.store(true, Ordering::Release);
    });
    lost
}
