use parking_lot::Mutex;
use vulkanalia::prelude::v1_0::*;

use super::{CmdBufferClass, CommandList};

/// One recorded-later command. Variants store plain values
/// rather than Vulkan info structs so entries carry no `p_next`
/// pointers and stay `Send` without ceremony.
pub enum DeferredCommand {
    CopyBuffer {
        class: CmdBufferClass,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        class: CmdBufferClass,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    },
    BlitImage {
        class: CmdBufferClass,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    },
    ClearColorImage {
        class: CmdBufferClass,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: vk::ClearColorValue,
        range: vk::ImageSubresourceRange,
    },
    Barrier {
        class: CmdBufferClass,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    },
}

/// Commands issued before any command list is open for the
/// frame. They accumulate here in issue order and are replayed
/// verbatim into the next recording, ahead of whatever that
/// recording adds.
#[derive(Default)]
pub struct DeferredCommandQueue {
    commands: Mutex<Vec<DeferredCommand>>,
}

impl DeferredCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: DeferredCommand) {
        self.commands.lock().push(command);
    }

    pub fn push_copy_buffer(
        &self,
        class: CmdBufferClass,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.push(DeferredCommand::CopyBuffer { class, src, dst, region });
    }

    pub fn push_copy_buffer_to_image(
        &self,
        class: CmdBufferClass,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        self.push(DeferredCommand::CopyBufferToImage { class, src, dst, dst_layout, region });
    }

    pub fn push_barrier(
        &self,
        class: CmdBufferClass,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        self.push(DeferredCommand::Barrier {
            class,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Takes every pending command, leaving the queue empty.
    pub fn take(&self) -> Vec<DeferredCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Replays every pending command into `list`, which must be
    /// recording, and leaves the queue empty.
    pub fn drain_into(&self, list: &mut CommandList) {
        for command in self.take() {
            match command {
                DeferredCommand::CopyBuffer { class, src, dst, region } => {
                    list.copy_buffer(class, src, dst, &[region]);
                }
                DeferredCommand::CopyBufferToImage { class, src, dst, dst_layout, region } => {
                    list.copy_buffer_to_image(class, src, dst, dst_layout, &[region]);
                }
                DeferredCommand::BlitImage {
                    class,
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    region,
                    filter,
                } => {
                    list.blit_image(class, src, src_layout, dst, dst_layout, &[region], filter);
                }
                DeferredCommand::ClearColorImage { class, image, layout, color, range } => {
                    list.clear_color_image(class, image, layout, &color, &[range]);
                }
                DeferredCommand::Barrier {
                    class,
                    src_stage,
                    src_access,
                    dst_stage,
                    dst_access,
                } => {
                    let barriers = [vk::MemoryBarrier2::builder()
                        .src_stage_mask(src_stage)
                        .src_access_mask(src_access)
                        .dst_stage_mask(dst_stage)
                        .dst_access_mask(dst_access)
                        .build()];

                    let dependency = vk::DependencyInfo::builder().memory_barriers(&barriers);
                    list.pipeline_barrier(class, &dependency);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_preserves_issue_order() {
        let queue = DeferredCommandQueue::new();

        queue.push_copy_buffer(
            CmdBufferClass::Transfer,
            vk::Buffer::null(),
            vk::Buffer::null(),
            vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 16 },
        );
        queue.push_barrier(
            CmdBufferClass::General,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::VERTEX_SHADER,
            vk::AccessFlags2::SHADER_READ,
        );
        queue.push_copy_buffer(
            CmdBufferClass::General,
            vk::Buffer::null(),
            vk::Buffer::null(),
            vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 32 },
        );

        let commands = queue.take();
        assert!(queue.is_empty());
        assert_eq!(commands.len(), 3);

        assert!(matches!(
            commands[0],
            DeferredCommand::CopyBuffer { class: CmdBufferClass::Transfer, region, .. }
                if region.size == 16
        ));
        assert!(matches!(commands[1], DeferredCommand::Barrier { .. }));
        assert!(matches!(
            commands[2],
            DeferredCommand::CopyBuffer { class: CmdBufferClass::General, region, .. }
                if region.size == 32
        ));
    }

    #[test]
    fn take_on_empty_queue_yields_nothing() {
        let queue = DeferredCommandQueue::new();
        assert!(queue.is_empty());
        assert!(queue.take().is_empty());
    }
}
