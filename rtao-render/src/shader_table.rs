use crate::{util::align_to, ConfigurationError, RenderError};
use rtao_graphics as gpu;

/// One record of a shader table.
#[derive(Clone, Debug, PartialEq)]
pub enum ShaderTableEntry {
    /// Named export of the pipeline followed by its local arguments.
    Program { name: String, local_args: Vec<u8> },
    /// Record that resolves to no program, keeping the offsets of the others.
    Null,
}

impl ShaderTableEntry {
    pub fn program(name: &str, local_args: &[u8]) -> Self {
        Self::Program {
            name: name.to_string(),
            local_args: local_args.to_vec(),
        }
    }

    pub fn required_size(&self) -> u32 {
        let args = match *self {
            Self::Program { ref local_args, .. } => local_args.len() as u32,
            Self::Null => 0,
        };
        gpu::limits::SHADER_IDENTIFIER_SIZE + args
    }
}

/// Records of one program category, laid out with a fixed stride.
pub struct ShaderTable {
    buffer: gpu::Buffer,
    stride: u32,
    names: Vec<Option<String>>,
}

impl ShaderTable {
    /// Lay out the entries at fixed offsets. The stride fits the largest entry.
    pub fn build(
        gpu: &gpu::Context,
        pipeline: &gpu::RayTracingPipeline,
        label: &str,
        entries: &[ShaderTableEntry],
    ) -> Result<Self, RenderError> {
        let max_size = entries
            .iter()
            .map(ShaderTableEntry::required_size)
            .max()
            .unwrap_or(gpu::limits::SHADER_IDENTIFIER_SIZE);
        let stride = align_to(
            max_size as u64,
            gpu::limits::SHADER_RECORD_ALIGNMENT as u64,
        ) as u32;
        if stride > gpu::limits::MAX_SHADER_RECORD_SIZE {
            return Err(ConfigurationError::RecordTooLarge {
                name: label.to_string(),
                required: max_size,
                limit: gpu::limits::MAX_SHADER_RECORD_SIZE,
            }
            .into());
        }

        let mut data = vec![0u8; (stride as usize * entries.len()).max(stride as usize)];
        let mut names = Vec::with_capacity(entries.len());
        for (entry, record) in entries.iter().zip(data.chunks_mut(stride as usize)) {
            match *entry {
                ShaderTableEntry::Program {
                    ref name,
                    ref local_args,
                } => {
                    let id = pipeline
                        .shader_identifier(name)
                        .ok_or_else(|| ConfigurationError::UnknownProgram(name.clone()))?;
                    let id_size = gpu::limits::SHADER_IDENTIFIER_SIZE as usize;
                    record[..id_size].copy_from_slice(&id.0);
                    record[id_size..id_size + local_args.len()].copy_from_slice(local_args);
                    names.push(Some(name.clone()));
                }
                ShaderTableEntry::Null => names.push(None),
            }
        }

        let buffer = gpu.create_buffer(gpu::BufferDesc {
            name: label,
            size: data.len() as u64,
            memory: gpu::Memory::Upload,
        })?;
        if let Err(e) = gpu.write_buffer(buffer.into(), &data) {
            gpu.destroy_buffer(buffer);
            return Err(e.into());
        }
        log::debug!(
            "Shader table '{}': {} records of {} bytes",
            label,
            entries.len(),
            stride
        );
        Ok(Self {
            buffer,
            stride,
            names,
        })
    }

    pub fn destroy(&self, gpu: &gpu::Context) {
        gpu.destroy_buffer(self.buffer);
    }

    pub fn buffer(&self) -> gpu::Buffer {
        self.buffer
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn record_count(&self) -> u32 {
        self.names.len() as u32
    }

    /// Byte offset of the record of the named program.
    pub fn offset_of(&self, name: &str) -> Option<u64> {
        self.names
            .iter()
            .position(|n| n.as_deref() == Some(name))
            .map(|index| index as u64 * self.stride as u64)
    }

    pub fn region(&self) -> gpu::ShaderTableRegion {
        gpu::ShaderTableRegion {
            start: self.buffer.at(0),
            size: self.stride as u64 * self.names.len() as u64,
            stride: self.stride as u64,
        }
    }
}
