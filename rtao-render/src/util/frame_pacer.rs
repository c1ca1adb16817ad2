use crate::FrameResources;
use rtao_graphics as gpu;

/// Number of frames that may be in flight at once.
pub const FRAME_COUNT: usize = 3;

#[derive(Default)]
struct FrameSlot {
    sync_point: Option<gpu::SyncPoint>,
    resources: FrameResources,
}

/// Utility object that encapsulates the logic
/// of keeping up to `FRAME_COUNT` frames in flight, and
/// cleaning up their temporary resources once they complete.
pub struct FramePacer {
    frame_index: usize,
    slots: [FrameSlot; FRAME_COUNT],
    command_encoder: Option<gpu::CommandEncoder>,
    next_resources: FrameResources,
}

impl FramePacer {
    pub fn new(context: &gpu::Context) -> Self {
        let encoder = context.create_command_encoder(gpu::CommandEncoderDesc {
            name: "main",
            buffer_count: FRAME_COUNT as u32,
        });
        Self {
            frame_index: 0,
            slots: Default::default(),
            command_encoder: Some(encoder),
            next_resources: FrameResources::default(),
        }
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Wait for the frame that last used the slot about to be reused,
    /// then release its temporary resources.
    #[profiling::function]
    fn wait_for_slot(&mut self, context: &gpu::Context, slot_index: usize) {
        let slot = &mut self.slots[slot_index];
        if let Some(sp) = slot.sync_point.take() {
            context.wait_for(&sp, !0);
        }
        slot.resources.destroy(context);
    }

    pub fn wait_for_all(&mut self, context: &gpu::Context) {
        for slot_index in 0..FRAME_COUNT {
            self.wait_for_slot(context, slot_index);
        }
    }

    /// Number of submitted frames whose completion has not been observed yet.
    pub fn frames_in_flight(&self, context: &gpu::Context) -> usize {
        self.slots
            .iter()
            .filter(|slot| match slot.sync_point {
                Some(ref sp) => !context.wait_for(sp, 0),
                None => false,
            })
            .count()
    }

    pub fn last_sync_point(&self) -> Option<&gpu::SyncPoint> {
        let last = (self.frame_index + FRAME_COUNT - 1) % FRAME_COUNT;
        self.slots[last].sync_point.as_ref()
    }

    pub fn destroy(&mut self, context: &gpu::Context) {
        self.wait_for_all(context);
        self.next_resources.destroy(context);
        if let Some(mut encoder) = self.command_encoder.take() {
            context.destroy_command_encoder(&mut encoder);
        }
    }

    /// Drop every tracked resource without destroying it.
    /// Used after the device has been recreated and the handles are gone.
    pub fn forget(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = FrameSlot::default();
        }
        self.next_resources = FrameResources::default();
    }

    pub fn begin_frame(
        &mut self,
        context: &gpu::Context,
    ) -> (&mut gpu::CommandEncoder, &mut FrameResources) {
        self.wait_for_slot(context, self.frame_index % FRAME_COUNT);
        let encoder = match self.command_encoder {
            Some(ref mut encoder) => encoder,
            None => panic!("Frame pacer is destroyed"),
        };
        encoder.start();
        (encoder, &mut self.next_resources)
    }

    /// Submit the frame. The temporary resources are released once it completes,
    /// even if the submission failed.
    pub fn end_frame(&mut self, context: &gpu::Context) -> Result<gpu::SyncPoint, gpu::DeviceError> {
        let encoder = match self.command_encoder {
            Some(ref mut encoder) => encoder,
            None => panic!("Frame pacer is destroyed"),
        };
        let result = context.submit(encoder);
        let slot = &mut self.slots[self.frame_index % FRAME_COUNT];
        slot.resources = std::mem::take(&mut self.next_resources);
        slot.sync_point = result.as_ref().ok().cloned();
        self.frame_index += 1;
        result
    }

    /// Timings of the last submitted frame.
    pub fn timings(&self) -> &gpu::Timings {
        static EMPTY: gpu::Timings = Vec::new();
        match self.command_encoder {
            Some(ref encoder) => encoder.timings(),
            None => &EMPTY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_frames_in_flight() {
        let context = gpu::Context::init(gpu::ContextDesc::default()).unwrap();
        let mut pacer = FramePacer::new(&context);
        for frame in 0..10 {
            let (_, resources) = pacer.begin_frame(&context);
            let buffer = context
                .create_buffer(gpu::BufferDesc {
                    name: "temp",
                    size: 16,
                    memory: gpu::Memory::Device,
                })
                .unwrap();
            resources.buffers.push(buffer);
            pacer.end_frame(&context).unwrap();
            assert!(pacer.frames_in_flight(&context) <= FRAME_COUNT);
            // at most one temporary buffer per frame slot is alive
            assert!(context.memory_usage() <= 16 * FRAME_COUNT.min(frame + 1) as u64);
        }
        pacer.destroy(&context);
        assert_eq!(context.memory_usage(), 0);
    }
}
