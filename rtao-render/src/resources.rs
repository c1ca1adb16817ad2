//! Render targets and buffers shared between the stages.
//!
//! Resources fall into two groups with separate lifetimes:
//! the device group survives window resizes, while the window group
//! is sized after the raytracing resolution and only changes through
//! [`ResourcePool::recreate_window_size_dependent`].

use crate::util::EnumArray;
use rtao_graphics as gpu;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum Resolution {
    /// One texel per launched ray batch.
    Raytracing,
    /// Raytracing resolution divided by the supersampling scale.
    Low,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum GBufferResource {
    /// World position in `xyz`, `w` is 1 for hits and 0 for misses.
    Position,
    /// World normal in `xyz`, hit distance in `w`.
    NormalDepth,
    MaterialId,
    Albedo,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, strum::EnumIter, strum::EnumCount)]
pub enum AoResource {
    /// Raw occlusion coefficient, 1 is fully unoccluded.
    Coefficient,
    /// Number of occluded AO rays per pixel.
    HitCount,
    /// Shadow ray visibility towards the light.
    Visibility,
    Variance,
    SmoothedVariance,
    /// Downsampled coefficient, then ping-ponged by the wavelet filter.
    Filtered,
    Upsampled,
}

crate::util::impl_enum_key!(Resolution, GBufferResource, AoResource);

impl GBufferResource {
    pub fn format(self) -> gpu::TextureFormat {
        match self {
            Self::Position | Self::NormalDepth => gpu::TextureFormat::Rgba32Float,
            Self::MaterialId => gpu::TextureFormat::R32Uint,
            Self::Albedo => gpu::TextureFormat::Rgba8Unorm,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Position => "gbuf-position",
            Self::NormalDepth => "gbuf-normal-depth",
            Self::MaterialId => "gbuf-material",
            Self::Albedo => "gbuf-albedo",
        }
    }
}

impl AoResource {
    pub fn format(self) -> gpu::TextureFormat {
        match self {
            Self::HitCount => gpu::TextureFormat::R32Uint,
            _ => gpu::TextureFormat::R32Float,
        }
    }

    pub fn resolution(self) -> Resolution {
        match self {
            Self::Coefficient | Self::HitCount | Self::Visibility | Self::Upsampled => {
                Resolution::Raytracing
            }
            Self::Variance | Self::SmoothedVariance | Self::Filtered => Resolution::Low,
        }
    }

    pub fn layer_count(self) -> usize {
        match self {
            Self::Variance | Self::Filtered => 2,
            _ => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Coefficient => "ao-coefficient",
            Self::HitCount => "ao-hit-count",
            Self::Visibility => "visibility",
            Self::Variance => "ao-variance",
            Self::SmoothedVariance => "ao-smoothed-variance",
            Self::Filtered => "ao-filtered",
            Self::Upsampled => "ao-upsampled",
        }
    }
}

/// Texture with one view per layer. Layers are separate textures,
/// used for ping-ponging between passes.
#[derive(Clone, Debug)]
pub struct RenderTarget {
    textures: Vec<gpu::Texture>,
    views: Vec<gpu::TextureView>,
    size: gpu::Extent,
    format: gpu::TextureFormat,
}

impl RenderTarget {
    fn new(
        name: &str,
        format: gpu::TextureFormat,
        size: gpu::Extent,
        layer_count: usize,
        encoder: &mut gpu::CommandEncoder,
        gpu: &gpu::Context,
        created: &mut Vec<RenderTarget>,
    ) -> Result<Self, gpu::DeviceError> {
        let mut target = Self {
            textures: Vec::with_capacity(layer_count),
            views: Vec::with_capacity(layer_count),
            size,
            format,
        };
        for i in 0..layer_count {
            let layer_name = if layer_count == 1 {
                name.to_string()
            } else {
                format!("{name}{i}")
            };
            let texture = match gpu.create_texture(gpu::TextureDesc {
                name: &layer_name,
                format,
                size,
                usage: gpu::TextureUsage::RESOURCE
                    | gpu::TextureUsage::STORAGE
                    | gpu::TextureUsage::COPY,
            }) {
                Ok(texture) => texture,
                Err(e) => {
                    created.push(target);
                    return Err(e);
                }
            };
            encoder.init_texture(texture);
            target.textures.push(texture);
            match gpu.create_texture_view(gpu::TextureViewDesc {
                name: &layer_name,
                texture,
            }) {
                Ok(view) => target.views.push(view),
                Err(e) => {
                    created.push(target);
                    return Err(e);
                }
            }
        }
        Ok(target)
    }

    fn destroy(&self, gpu: &gpu::Context) {
        for &view in self.views.iter() {
            gpu.destroy_texture_view(view);
        }
        for &texture in self.textures.iter() {
            gpu.destroy_texture(texture);
        }
    }

    pub fn texture(&self, layer: usize) -> gpu::Texture {
        self.textures[layer]
    }

    pub fn view(&self, layer: usize) -> gpu::TextureView {
        self.views[layer]
    }

    pub fn layer_count(&self) -> usize {
        self.textures.len()
    }

    pub fn size(&self) -> gpu::Extent {
        self.size
    }

    pub fn format(&self) -> gpu::TextureFormat {
        self.format
    }
}

struct WindowResources {
    sizes: EnumArray<Resolution, gpu::Extent>,
    gbuffer: EnumArray<Resolution, EnumArray<GBufferResource, RenderTarget>>,
    ao: EnumArray<AoResource, RenderTarget>,
    composed: RenderTarget,
}

impl WindowResources {
    fn targets(&self) -> impl Iterator<Item = &RenderTarget> {
        self.gbuffer
            .values()
            .flat_map(|set| set.values())
            .chain(self.ao.values())
            .chain(Some(&self.composed))
    }
}

/// Buffers that only depend on the device.
struct DeviceResources {
    scene_constants: gpu::Buffer,
    hit_counts: gpu::Buffer,
    hemisphere_samples: Option<gpu::Buffer>,
}

pub struct ResourcePool {
    device: DeviceResources,
    window: Option<WindowResources>,
}

/// Size reserved for the scene constants, larger than any constant block.
pub const SCENE_CONSTANTS_SIZE: u64 = 256;

impl ResourcePool {
    pub fn new(gpu: &gpu::Context) -> Result<Self, gpu::DeviceError> {
        let scene_constants = gpu.create_buffer(gpu::BufferDesc {
            name: "scene constants",
            size: SCENE_CONSTANTS_SIZE,
            memory: gpu::Memory::Device,
        })?;
        let hit_counts = match gpu.create_buffer(gpu::BufferDesc {
            name: "hit counts",
            size: crate::diagnostics::HIT_COUNT_BUFFER_SIZE,
            memory: gpu::Memory::Shared,
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                gpu.destroy_buffer(scene_constants);
                return Err(e);
            }
        };
        Ok(Self {
            device: DeviceResources {
                scene_constants,
                hit_counts,
                hemisphere_samples: None,
            },
            window: None,
        })
    }

    pub fn destroy(&mut self, gpu: &gpu::Context) {
        self.destroy_window_size_dependent(gpu);
        gpu.destroy_buffer(self.device.scene_constants);
        gpu.destroy_buffer(self.device.hit_counts);
        if let Some(buffer) = self.device.hemisphere_samples.take() {
            gpu.destroy_buffer(buffer);
        }
    }

    pub fn destroy_window_size_dependent(&mut self, gpu: &gpu::Context) {
        if let Some(window) = self.window.take() {
            for target in window.targets() {
                target.destroy(gpu);
            }
        }
    }

    /// Replace every window size dependent resource with one of the new size.
    ///
    /// On failure the pool is left without window resources, nothing
    /// partially created survives.
    #[profiling::function]
    pub fn recreate_window_size_dependent(
        &mut self,
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        size: gpu::Extent,
        supersampling_scale: u32,
    ) -> Result<(), gpu::DeviceError> {
        self.destroy_window_size_dependent(gpu);
        let sizes = EnumArray::from_fn(|resolution| match resolution {
            Resolution::Raytracing => size,
            Resolution::Low => size.downscaled(supersampling_scale),
        });
        log::info!(
            "Creating window resources: raytracing {:?}, low {:?}",
            sizes[Resolution::Raytracing],
            sizes[Resolution::Low]
        );

        let mut created = Vec::new();
        let result = Self::create_window_resources(gpu, encoder, &sizes, &mut created);
        match result {
            Ok(window) => {
                self.window = Some(window);
                Ok(())
            }
            Err(e) => {
                log::error!("Window resource creation failed: {}", e);
                for target in created.iter() {
                    target.destroy(gpu);
                }
                Err(e)
            }
        }
    }

    fn create_window_resources(
        gpu: &gpu::Context,
        encoder: &mut gpu::CommandEncoder,
        sizes: &EnumArray<Resolution, gpu::Extent>,
        created: &mut Vec<RenderTarget>,
    ) -> Result<WindowResources, gpu::DeviceError> {
        // Everything made so far goes into `created` on failure.
        fn keep<K: crate::util::EnumKey>(
            result: Result<EnumArray<K, RenderTarget>, (Vec<RenderTarget>, gpu::DeviceError)>,
            created: &mut Vec<RenderTarget>,
        ) -> Result<EnumArray<K, RenderTarget>, gpu::DeviceError> {
            result.map_err(|(partial, e)| {
                created.extend(partial);
                e
            })
        }

        let gbuffer = EnumArray::<Resolution, _>::try_from_fn(|resolution| {
            let set = EnumArray::try_from_fn(|resource: GBufferResource| {
                let name = match resolution {
                    Resolution::Raytracing => resource.name().to_string(),
                    Resolution::Low => format!("{}-low", resource.name()),
                };
                RenderTarget::new(
                    &name,
                    resource.format(),
                    sizes[resolution],
                    1,
                    encoder,
                    gpu,
                    created,
                )
            });
            keep(set, created)
        });
        let gbuffer = gbuffer.map_err(|(partial, e): (Vec<EnumArray<_, _>>, _)| {
            for set in partial {
                created.extend(set.into_values());
            }
            e
        })?;
        let ao = EnumArray::try_from_fn(|resource: AoResource| {
            RenderTarget::new(
                resource.name(),
                resource.format(),
                sizes[resource.resolution()],
                resource.layer_count(),
                encoder,
                gpu,
                created,
            )
        });
        let ao = match keep(ao, created) {
            Ok(ao) => ao,
            Err(e) => {
                for set in gbuffer.into_values() {
                    created.extend(set.into_values());
                }
                return Err(e);
            }
        };
        let composed = RenderTarget::new(
            "composed",
            gpu::TextureFormat::Rgba8Unorm,
            sizes[Resolution::Raytracing],
            1,
            encoder,
            gpu,
            created,
        );
        match composed {
            Ok(composed) => Ok(WindowResources {
                sizes: sizes.clone(),
                gbuffer,
                ao,
                composed,
            }),
            Err(e) => {
                for set in gbuffer.into_values() {
                    created.extend(set.into_values());
                }
                created.extend(ao.into_values());
                Err(e)
            }
        }
    }

    pub fn has_window_resources(&self) -> bool {
        self.window.is_some()
    }

    fn window(&self) -> &WindowResources {
        match self.window {
            Some(ref window) => window,
            None => panic!("Window resources are not created"),
        }
    }

    pub fn extent(&self, resolution: Resolution) -> gpu::Extent {
        match self.window {
            Some(ref window) => window.sizes[resolution],
            None => gpu::Extent::default(),
        }
    }

    pub fn gbuffer(&self, resolution: Resolution, resource: GBufferResource) -> &RenderTarget {
        &self.window().gbuffer[resolution][resource]
    }

    pub fn ao(&self, resource: AoResource) -> &RenderTarget {
        &self.window().ao[resource]
    }

    pub fn composed(&self) -> &RenderTarget {
        &self.window().composed
    }

    pub fn scene_constants(&self) -> gpu::Buffer {
        self.device.scene_constants
    }

    pub fn hit_counts(&self) -> gpu::Buffer {
        self.device.hit_counts
    }

    /// Hemisphere sample buffer, present once a sample set is uploaded.
    pub fn hemisphere_samples(&self) -> Option<gpu::Buffer> {
        self.device.hemisphere_samples
    }

    /// Upload the hemisphere directions of a sample set, retiring the
    /// previous buffer into `temp`. The square points stay on the host.
    pub fn upload_samples(
        &mut self,
        gpu: &gpu::Context,
        samples: &crate::samples::SampleSet,
        temp: &mut crate::FrameResources,
    ) -> Result<(), gpu::DeviceError> {
        let hemisphere = samples.hemisphere_data();
        let hemisphere_buf = gpu.create_buffer(gpu::BufferDesc {
            name: "hemisphere samples",
            size: (hemisphere.len() * 16).max(16) as u64,
            memory: gpu::Memory::Shared,
        })?;
        if let Err(e) = gpu.write_buffer(hemisphere_buf.into(), bytemuck::cast_slice(&hemisphere)) {
            gpu.destroy_buffer(hemisphere_buf);
            return Err(e);
        }
        temp.buffers
            .extend(self.device.hemisphere_samples.replace(hemisphere_buf));
        Ok(())
    }
}
