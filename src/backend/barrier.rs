// Image layout transitions
//
// Passes describe their transitions as data; `record` turns a batch into a
// single vkCmdPipelineBarrier.

use ash::vk;

/// One layout change with the stages/accesses it orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutChange {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

impl LayoutChange {
    /// Fresh transfer destination, contents discarded
    pub const UNDEFINED_TO_TRANSFER_DST: Self = Self {
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        src_access: vk::AccessFlags::empty(),
        dst_stage: vk::PipelineStageFlags::TRANSFER,
        dst_access: vk::AccessFlags::TRANSFER_WRITE,
    };

    /// Uploaded texture ready for sampling. Recorded on the transfer queue,
    /// so the destination side can only be bottom-of-pipe there; the render
    /// submission is ordered after the transfer fence.
    pub const TRANSFER_DST_TO_SHADER_READ: Self = Self {
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        src_access: vk::AccessFlags::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        dst_access: vk::AccessFlags::empty(),
    };

    pub fn is_noop(&self) -> bool {
        self.old_layout == self.new_layout
            && self.src_access.is_empty()
            && self.dst_access.is_empty()
    }
}

/// Whether a set of images has left UNDEFINED on the GPU. A recorded
/// transition only counts once its command buffer was actually submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirstUse {
    initialized: bool,
    recorded: bool,
}

impl FirstUse {
    /// Layout state to record transitions from; stages the first use
    pub fn record(&mut self) -> bool {
        self.recorded = true;
        self.initialized
    }

    /// The recording was submitted
    pub fn commit(&mut self) {
        if self.recorded {
            self.initialized = true;
            self.recorded = false;
        }
    }

    /// The recording never reached the queue
    pub fn discard(&mut self) {
        self.recorded = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub change: LayoutChange,
}

/// Union of every stage the batch waits on and blocks
pub fn combined_stages(barriers: &[ImageBarrier]) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
    barriers.iter().fold(
        (vk::PipelineStageFlags::empty(), vk::PipelineStageFlags::empty()),
        |(src, dst), b| (src | b.change.src_stage, dst | b.change.dst_stage),
    )
}

pub fn record(device: &ash::Device, cmd: vk::CommandBuffer, barriers: &[ImageBarrier]) {
    if barriers.is_empty() {
        return;
    }

    let image_barriers: Vec<vk::ImageMemoryBarrier> = barriers
        .iter()
        .map(|b| {
            vk::ImageMemoryBarrier::default()
                .old_layout(b.change.old_layout)
                .new_layout(b.change.new_layout)
                .src_access_mask(b.change.src_access)
                .dst_access_mask(b.change.dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(b.image)
                .subresource_range(b.range)
        })
        .collect();

    let (src_stage, dst_stage) = combined_stages(barriers);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &image_barriers,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::subresource_range;

    #[test]
    fn batch_stages_are_unioned() {
        let range = subresource_range(vk::ImageAspectFlags::COLOR);
        let barriers = [
            ImageBarrier {
                image: vk::Image::null(),
                range,
                change: LayoutChange::UNDEFINED_TO_TRANSFER_DST,
            },
            ImageBarrier {
                image: vk::Image::null(),
                range,
                change: LayoutChange::TRANSFER_DST_TO_SHADER_READ,
            },
        ];

        let (src, dst) = combined_stages(&barriers);
        assert_eq!(src, vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst, vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        assert_eq!(combined_stages(&[]).0, vk::PipelineStageFlags::empty());
    }

    #[test]
    fn first_use_counts_only_after_submission() {
        let mut layouts = FirstUse::default();
        assert!(!layouts.record());

        // Submission failed: the images are still UNDEFINED
        layouts.discard();
        layouts.commit();
        assert!(!layouts.is_initialized());
        assert!(!layouts.record());

        layouts.commit();
        assert!(layouts.is_initialized());
        assert!(layouts.record());

        // A later failed frame does not undo an earlier submission
        layouts.discard();
        assert!(layouts.is_initialized());
    }

    #[test]
    fn upload_transitions_chain() {
        let first = LayoutChange::UNDEFINED_TO_TRANSFER_DST;
        let second = LayoutChange::TRANSFER_DST_TO_SHADER_READ;
        assert_eq!(first.new_layout, second.old_layout);
        assert!(!first.is_noop());
    }
}
