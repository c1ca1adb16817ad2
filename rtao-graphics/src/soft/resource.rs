use std::collections::HashMap;

use rayon::prelude::*;

use super::accel::BuiltStructure;

pub(super) struct BufferData {
    pub name: String,
    pub memory: crate::Memory,
    pub data: Vec<u8>,
}

pub(super) struct TextureData {
    pub name: String,
    pub usage: crate::TextureUsage,
    pub state: crate::TextureState,
    /// `None` while the image is detached for writing by a dispatch.
    pub image: Option<TexelImage>,
}

pub(super) struct ViewData {
    pub texture: u32,
}

pub(super) struct AccelData {
    pub name: String,
    pub ty: crate::AccelerationStructureType,
    pub size: u64,
    pub flags: crate::AccelerationStructureFlags,
    pub built: Option<BuiltStructure>,
}

#[derive(Default)]
pub(super) struct Storage {
    next_id: u32,
    pub allocated: u64,
    pub buffers: HashMap<u32, BufferData>,
    pub textures: HashMap<u32, TextureData>,
    pub views: HashMap<u32, ViewData>,
    pub acceleration_structures: HashMap<u32, AccelData>,
}

impl Storage {
    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn resource_count(&self) -> usize {
        self.buffers.len() + self.textures.len() + self.views.len() + self.acceleration_structures.len()
    }

    pub fn buffer(&self, buffer: super::Buffer) -> Result<&BufferData, crate::DeviceError> {
        self.buffers
            .get(&buffer.raw)
            .ok_or(crate::DeviceError::InvalidResource("buffer"))
    }

    pub fn buffer_mut(
        &mut self,
        buffer: super::Buffer,
    ) -> Result<&mut BufferData, crate::DeviceError> {
        self.buffers
            .get_mut(&buffer.raw)
            .ok_or(crate::DeviceError::InvalidResource("buffer"))
    }

    /// Bytes of a buffer starting at the piece offset.
    pub fn buffer_bytes(&self, piece: crate::BufferPiece) -> Result<&[u8], crate::DeviceError> {
        let data = &self.buffer(piece.buffer)?.data;
        data.get(piece.offset as usize..)
            .ok_or(crate::DeviceError::InvalidResource("buffer offset"))
    }

    pub fn texture(&self, texture: super::Texture) -> Result<&TextureData, crate::DeviceError> {
        self.textures
            .get(&texture.raw)
            .ok_or(crate::DeviceError::InvalidResource("texture"))
    }

    pub fn texture_mut(
        &mut self,
        texture: super::Texture,
    ) -> Result<&mut TextureData, crate::DeviceError> {
        self.textures
            .get_mut(&texture.raw)
            .ok_or(crate::DeviceError::InvalidResource("texture"))
    }

    pub fn view_texture(&self, view: super::TextureView) -> Result<super::Texture, crate::DeviceError> {
        self.views
            .get(&view.raw)
            .map(|v| super::Texture { raw: v.texture })
            .ok_or(crate::DeviceError::InvalidResource("texture view"))
    }

    pub fn accel(
        &self,
        accel: super::AccelerationStructure,
    ) -> Result<&AccelData, crate::DeviceError> {
        self.acceleration_structures
            .get(&accel.raw)
            .ok_or(crate::DeviceError::InvalidResource("acceleration structure"))
    }
}

/// CPU image behind a texture. Texels are stored as `f32` channels
/// regardless of the format, normalized formats are quantized on store.
#[derive(Clone, Debug, PartialEq)]
pub struct TexelImage {
    extent: crate::Extent,
    format: crate::TextureFormat,
    texels: Vec<f32>,
}

impl TexelImage {
    pub fn new(format: crate::TextureFormat, extent: crate::Extent) -> Self {
        let count = extent.texel_count() as usize * format.channel_count();
        Self {
            extent,
            format,
            texels: vec![0.0; count],
        }
    }

    pub fn extent(&self) -> crate::Extent {
        self.extent
    }

    pub fn format(&self) -> crate::TextureFormat {
        self.format
    }

    pub fn texels(&self) -> &[f32] {
        &self.texels
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.extent.width as usize + x as usize) * self.format.channel_count()
    }

    pub fn load(&self, x: u32, y: u32) -> [f32; 4] {
        let channels = self.format.channel_count();
        let offset = self.offset(x, y);
        let mut value = [0.0, 0.0, 0.0, 1.0];
        value[..channels].copy_from_slice(&self.texels[offset..offset + channels]);
        value
    }

    /// Load with coordinates clamped to the image edges.
    pub fn load_clamped(&self, x: i32, y: i32) -> [f32; 4] {
        let x = x.clamp(0, self.extent.width as i32 - 1);
        let y = y.clamp(0, self.extent.height as i32 - 1);
        self.load(x as u32, y as u32)
    }

    pub fn store(&mut self, x: u32, y: u32, value: [f32; 4]) {
        let channels = self.format.channel_count();
        let format = self.format;
        let offset = self.offset(x, y);
        for (dst, &src) in self.texels[offset..offset + channels].iter_mut().zip(value.iter()) {
            *dst = quantize(format, src);
        }
    }

    pub fn fill(&mut self, value: [f32; 4]) {
        let channels = self.format.channel_count();
        let format = self.format;
        for texel in self.texels.chunks_mut(channels) {
            for (dst, &src) in texel.iter_mut().zip(value.iter()) {
                *dst = quantize(format, src);
            }
        }
    }

    /// Evaluate `fun` for every texel inside both the image and `grid`, in parallel rows.
    /// Texels outside of `grid` keep their contents.
    pub fn par_fill(&mut self, grid: crate::Extent, fun: impl Fn(u32, u32) -> [f32; 4] + Sync) {
        let channels = self.format.channel_count();
        let format = self.format;
        let width = self.extent.width.min(grid.width) as usize;
        let height = self.extent.height.min(grid.height) as usize;
        let row_len = self.extent.width as usize * channels;
        if row_len == 0 {
            return;
        }
        self.texels
            .par_chunks_mut(row_len)
            .take(height)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let value = fun(x as u32, y as u32);
                    for (dst, &src) in row[x * channels..(x + 1) * channels]
                        .iter_mut()
                        .zip(value.iter())
                    {
                        *dst = quantize(format, src);
                    }
                }
            });
    }
}

fn quantize(format: crate::TextureFormat, value: f32) -> f32 {
    match format {
        crate::TextureFormat::Rgba8Unorm | crate::TextureFormat::Bgra8Unorm => {
            (value.clamp(0.0, 1.0) * 255.0).round() / 255.0
        }
        crate::TextureFormat::R32Uint => value.max(0.0).floor(),
        _ => value,
    }
}

fn texture_size(desc: &crate::TextureDesc) -> u64 {
    desc.size.texel_count() * desc.format.bytes_per_texel() as u64
}

impl super::Context {
    fn reserve(&self, storage: &mut Storage, name: &str, size: u64) -> Result<(), crate::DeviceError> {
        if self.is_lost() {
            return Err(crate::DeviceError::Lost);
        }
        let budget = self.memory_budget();
        let available = budget.saturating_sub(storage.allocated);
        if size > available {
            log::warn!(
                "Allocation of '{}' ({} bytes) exceeds the available {} bytes",
                name,
                size,
                available
            );
            return Err(crate::DeviceError::OutOfMemory {
                name: name.to_string(),
                requested: size,
                available,
            });
        }
        storage.allocated += size;
        Ok(())
    }

    pub fn create_buffer(&self, desc: crate::BufferDesc) -> Result<super::Buffer, crate::DeviceError> {
        let mut storage = self.storage.lock().unwrap();
        self.reserve(&mut storage, desc.name, desc.size)?;
        let raw = storage.allocate_id();
        storage.buffers.insert(
            raw,
            BufferData {
                name: desc.name.to_string(),
                memory: desc.memory,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(super::Buffer { raw })
    }

    pub fn destroy_buffer(&self, buffer: super::Buffer) {
        let mut storage = self.storage.lock().unwrap();
        match storage.buffers.remove(&buffer.raw) {
            Some(data) => storage.allocated -= data.data.len() as u64,
            None => log::warn!("Destroying an unknown buffer {:?}", buffer),
        }
    }

    pub fn buffer_size(&self, buffer: super::Buffer) -> Result<u64, crate::DeviceError> {
        let storage = self.storage.lock().unwrap();
        Ok(storage.buffer(buffer)?.data.len() as u64)
    }

    /// Write host data into a host-visible buffer.
    pub fn write_buffer(&self, piece: crate::BufferPiece, data: &[u8]) -> Result<(), crate::DeviceError> {
        let mut storage = self.storage.lock().unwrap();
        let buffer = storage.buffer_mut(piece.buffer)?;
        assert!(
            buffer.memory.is_host_visible(),
            "Buffer '{}' is not host visible",
            buffer.name
        );
        let start = piece.offset as usize;
        let end = start + data.len();
        if end > buffer.data.len() {
            return Err(crate::DeviceError::InvalidResource("buffer range"));
        }
        buffer.data[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn write_buffer_pod<T: bytemuck::Pod>(
        &self,
        piece: crate::BufferPiece,
        data: &[T],
    ) -> Result<(), crate::DeviceError> {
        self.write_buffer(piece, bytemuck::cast_slice(data))
    }

    /// Read back `size` bytes of a host-visible buffer.
    pub fn read_buffer(&self, piece: crate::BufferPiece, size: u64) -> Result<Vec<u8>, crate::DeviceError> {
        let storage = self.storage.lock().unwrap();
        let buffer = storage.buffer(piece.buffer)?;
        assert!(
            buffer.memory.is_host_visible(),
            "Buffer '{}' is not host visible",
            buffer.name
        );
        let start = piece.offset as usize;
        buffer
            .data
            .get(start..start + size as usize)
            .map(|bytes| bytes.to_vec())
            .ok_or(crate::DeviceError::InvalidResource("buffer range"))
    }

    pub fn create_texture(&self, desc: crate::TextureDesc) -> Result<super::Texture, crate::DeviceError> {
        let mut storage = self.storage.lock().unwrap();
        self.reserve(&mut storage, desc.name, texture_size(&desc))?;
        let raw = storage.allocate_id();
        storage.textures.insert(
            raw,
            TextureData {
                name: desc.name.to_string(),
                usage: desc.usage,
                state: crate::TextureState::Undefined,
                image: Some(TexelImage::new(desc.format, desc.size)),
            },
        );
        Ok(super::Texture { raw })
    }

    pub fn destroy_texture(&self, texture: super::Texture) {
        let mut storage = self.storage.lock().unwrap();
        match storage.textures.remove(&texture.raw) {
            Some(data) => {
                if let Some(ref image) = data.image {
                    storage.allocated -=
                        image.extent().texel_count() * image.format().bytes_per_texel() as u64;
                }
            }
            None => log::warn!("Destroying an unknown texture {:?}", texture),
        }
    }

    pub fn create_texture_view(
        &self,
        desc: crate::TextureViewDesc,
    ) -> Result<super::TextureView, crate::DeviceError> {
        let mut storage = self.storage.lock().unwrap();
        if self.is_lost() {
            return Err(crate::DeviceError::Lost);
        }
        storage.texture(desc.texture)?;
        let raw = storage.allocate_id();
        storage.views.insert(
            raw,
            ViewData {
                texture: desc.texture.raw,
            },
        );
        log::trace!("Created view '{}'", desc.name);
        Ok(super::TextureView { raw })
    }

    pub fn destroy_texture_view(&self, view: super::TextureView) {
        let mut storage = self.storage.lock().unwrap();
        if storage.views.remove(&view.raw).is_none() {
            log::warn!("Destroying an unknown view {:?}", view);
        }
    }

    pub fn texture_extent(&self, texture: super::Texture) -> Result<crate::Extent, crate::DeviceError> {
        let storage = self.storage.lock().unwrap();
        let data = storage.texture(texture)?;
        data.image
            .as_ref()
            .map(|image| image.extent())
            .ok_or_else(|| crate::DeviceError::Aliasing(data.name.clone()))
    }

    pub fn texture_state(&self, texture: super::Texture) -> Result<crate::TextureState, crate::DeviceError> {
        let storage = self.storage.lock().unwrap();
        Ok(storage.texture(texture)?.state)
    }

    /// Debug readback of the texture contents.
    pub fn read_texture(&self, texture: super::Texture) -> Result<TexelImage, crate::DeviceError> {
        let storage = self.storage.lock().unwrap();
        let data = storage.texture(texture)?;
        data.image
            .clone()
            .ok_or_else(|| crate::DeviceError::Aliasing(data.name.clone()))
    }

    pub fn create_acceleration_structure(
        &self,
        desc: crate::AccelerationStructureDesc,
    ) -> Result<super::AccelerationStructure, crate::DeviceError> {
        let mut storage = self.storage.lock().unwrap();
        self.reserve(&mut storage, desc.name, desc.size)?;
        let raw = storage.allocate_id();
        storage.acceleration_structures.insert(
            raw,
            AccelData {
                name: desc.name.to_string(),
                ty: desc.ty,
                size: desc.size,
                flags: desc.flags,
                built: None,
            },
        );
        Ok(super::AccelerationStructure { raw })
    }

    pub fn destroy_acceleration_structure(&self, accel: super::AccelerationStructure) {
        let mut storage = self.storage.lock().unwrap();
        match storage.acceleration_structures.remove(&accel.raw) {
            Some(data) => storage.allocated -= data.size,
            None => log::warn!("Destroying an unknown acceleration structure {:?}", accel),
        }
    }

    /// Whether the acceleration structure has been built by a completed submission.
    pub fn is_acceleration_structure_built(&self, accel: super::AccelerationStructure) -> bool {
        let storage = self.storage.lock().unwrap();
        storage
            .accel(accel)
            .map_or(false, |data| data.built.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::TexelImage;
    use crate::{Extent, TextureFormat};

    #[test]
    fn unorm_quantization() {
        let mut image = TexelImage::new(TextureFormat::Rgba8Unorm, Extent::new_2d(2, 1));
        image.store(1, 0, [2.0, -1.0, 0.5, 1.0]);
        let value = image.load(1, 0);
        assert_eq!(value[0], 1.0);
        assert_eq!(value[1], 0.0);
        assert!((value[2] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn par_fill_respects_grid() {
        let mut image = TexelImage::new(TextureFormat::R32Float, Extent::new_2d(4, 4));
        image.fill([7.0; 4]);
        image.par_fill(Extent::new_2d(2, 3), |x, y| [(x + 10 * y) as f32, 0.0, 0.0, 0.0]);
        assert_eq!(image.load(1, 2)[0], 21.0);
        assert_eq!(image.load(3, 0)[0], 7.0);
        assert_eq!(image.load(0, 3)[0], 7.0);
        assert_eq!(image.load_clamped(-5, 1)[0], 10.0);
    }
}
