// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// Three frames in flight, each slot owning its own semaphores, fence,
// command buffer and uniform buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::memory::GpuBuffer;
use super::VulkanDevice;
use crate::error::RenderError;

pub const FRAMES_IN_FLIGHT: usize = 3;

/// Monotonic frame number; selects the slot used by the next `draw`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounter {
    frame: u64,
}

impl FrameCounter {
    pub fn current(&self) -> u64 {
        self.frame
    }

    pub fn slot(&self) -> usize {
        (self.frame % FRAMES_IN_FLIGHT as u64) as usize
    }

    pub fn advance(&mut self) {
        self.frame += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
}

/// Per-slot lifecycle: Idle -> Acquiring -> Recording -> Submitted, back to
/// Idle once the slot's fence has been waited on
#[derive(Debug)]
pub struct SlotTracker {
    states: [SlotState; FRAMES_IN_FLIGHT],
}

impl Default for SlotTracker {
    fn default() -> Self {
        Self { states: [SlotState::Idle; FRAMES_IN_FLIGHT] }
    }
}

impl SlotTracker {
    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    fn transition(&mut self, slot: usize, from: &[SlotState], to: SlotState) -> Result<()> {
        let state = self.states[slot];
        anyhow::ensure!(
            from.contains(&state),
            "Frame slot {} cannot go from {:?} to {:?}",
            slot,
            state,
            to
        );
        self.states[slot] = to;
        Ok(())
    }

    /// The slot's fence has signaled
    pub fn retire(&mut self, slot: usize) -> Result<()> {
        self.transition(slot, &[SlotState::Idle, SlotState::Submitted], SlotState::Idle)
    }

    pub fn begin_acquire(&mut self, slot: usize) -> Result<()> {
        self.transition(slot, &[SlotState::Idle], SlotState::Acquiring)
    }

    /// Acquire failed (out of date); nothing was recorded
    pub fn abort_acquire(&mut self, slot: usize) -> Result<()> {
        self.transition(slot, &[SlotState::Acquiring], SlotState::Idle)
    }

    pub fn begin_recording(&mut self, slot: usize) -> Result<()> {
        self.transition(slot, &[SlotState::Acquiring], SlotState::Recording)
    }

    /// Recording or submission failed and the slot's fence was replaced
    /// with a fresh signaled one
    pub fn abandon(&mut self, slot: usize) -> Result<()> {
        self.transition(slot, &[SlotState::Recording], SlotState::Idle)
    }

    /// Recording or submission failed and an empty submission now consumes
    /// the acquire semaphore and signals the slot's fence
    pub fn recover(&mut self, slot: usize) -> Result<()> {
        self.transition(slot, &[SlotState::Recording], SlotState::Submitted)
    }

    pub fn mark_submitted(&mut self, slot: usize) -> Result<()> {
        self.transition(slot, &[SlotState::Recording], SlotState::Submitted)
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.states.iter().filter(|&&s| s == SlotState::Submitted).count()
    }
}

/// Everything one frame in flight owns
pub struct FrameResources {
    device: Arc<VulkanDevice>,
    /// Signaled by acquire, waited on by submit
    pub present_semaphore: vk::Semaphore,
    /// Signaled by submit, waited on by present
    pub render_semaphore: vk::Semaphore,
    /// Signaled when the slot's submission retires (created signaled)
    pub render_fence: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
    pub uniform_buffer: GpuBuffer,
    pub uniform_set: vk::DescriptorSet,
}

impl FrameResources {
    pub fn new(
        device: &Arc<VulkanDevice>,
        command_buffer: vk::CommandBuffer,
        uniform_buffer: GpuBuffer,
        uniform_set: vk::DescriptorSet,
    ) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();

        let present_semaphore = create_semaphore(device, &semaphore_info)?;
        let render_semaphore = match create_semaphore(device, &semaphore_info) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_semaphore(present_semaphore, None) };
                return Err(e);
            }
        };
        let render_fence = match create_fence(device, true) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    device.device.destroy_semaphore(present_semaphore, None);
                    device.device.destroy_semaphore(render_semaphore, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            device: device.clone(),
            present_semaphore,
            render_semaphore,
            render_fence,
            command_buffer,
            uniform_buffer,
            uniform_set,
        })
    }
}

impl FrameResources {
    /// Swap the render fence for a new signaled one; only valid while no
    /// submission references the old fence
    pub fn replace_fence(&mut self) -> Result<()> {
        let fence = create_fence(&self.device, true)?;
        unsafe { self.device.device.destroy_fence(self.render_fence, None) };
        self.render_fence = fence;
        Ok(())
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.present_semaphore, None);
            self.device.device.destroy_semaphore(self.render_semaphore, None);
            self.device.device.destroy_fence(self.render_fence, None);
        }
    }
}

fn create_semaphore(device: &VulkanDevice, info: &vk::SemaphoreCreateInfo) -> Result<vk::Semaphore> {
    unsafe { device.device.create_semaphore(info, None) }.context("Failed to create semaphore")
}

pub fn create_fence(device: &VulkanDevice, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let fence_info = vk::FenceCreateInfo::default().flags(flags);
    unsafe { device.device.create_fence(&fence_info, None) }.context("Failed to create fence")
}

/// Typed error for a failed fence wait
pub fn fence_wait_error(result: vk::Result, what: &'static str, timeout: Duration) -> anyhow::Error {
    match result {
        vk::Result::TIMEOUT => RenderError::FenceTimeout { what, timeout }.into(),
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost { what }.into(),
        other => anyhow::Error::new(other).context(format!("Failed to wait for the {} fence", what)),
    }
}

/// Typed error for a failed queue submission
pub fn submit_error(result: vk::Result, what: &'static str) -> anyhow::Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost { what }.into(),
        other => anyhow::Error::new(other).context(format!("Failed to submit {} work", what)),
    }
}

/// Submission without command buffers that waits on `semaphore` and
/// signals `fence`; the fence may be signaled or not beforehand
pub fn submit_empty(
    device: &ash::Device,
    queue: vk::Queue,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
) -> Result<()> {
    let wait_semaphores = [semaphore];
    let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages);

    unsafe {
        device.reset_fences(&[fence]).context("Failed to reset fence")?;
        device
            .queue_submit(queue, &[submit_info], fence)
            .map_err(|result| submit_error(result, "empty"))
    }
}

/// Bounded wait on a single fence
pub fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout: Duration,
    what: &'static str,
) -> Result<()> {
    let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    unsafe { device.wait_for_fences(&[fence], true, nanos) }
        .map_err(|result| fence_wait_error(result, what, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_through_three() {
        let mut counter = FrameCounter::default();
        let slots: Vec<usize> = (0..7)
            .map(|_| {
                let slot = counter.slot();
                counter.advance();
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(counter.current(), 7);
    }

    #[test]
    fn full_frame_lifecycle() {
        let mut tracker = SlotTracker::default();
        tracker.retire(0).unwrap();
        tracker.begin_acquire(0).unwrap();
        tracker.begin_recording(0).unwrap();
        tracker.mark_submitted(0).unwrap();
        assert_eq!(tracker.state(0), SlotState::Submitted);
        assert_eq!(tracker.in_flight(), 1);

        tracker.retire(0).unwrap();
        assert_eq!(tracker.state(0), SlotState::Idle);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn cannot_record_before_acquire() {
        let mut tracker = SlotTracker::default();
        assert!(tracker.begin_recording(1).is_err());
        assert!(tracker.mark_submitted(1).is_err());
        assert_eq!(tracker.state(1), SlotState::Idle);
    }

    #[test]
    fn cannot_reuse_a_slot_before_its_fence() {
        let mut tracker = SlotTracker::default();
        tracker.begin_acquire(2).unwrap();
        tracker.begin_recording(2).unwrap();
        tracker.mark_submitted(2).unwrap();
        assert!(tracker.begin_acquire(2).is_err());
    }

    #[test]
    fn out_of_date_acquire_returns_to_idle() {
        let mut tracker = SlotTracker::default();
        tracker.begin_acquire(0).unwrap();
        tracker.abort_acquire(0).unwrap();
        assert_eq!(tracker.state(0), SlotState::Idle);
        assert!(tracker.abort_acquire(0).is_err());
    }

    #[test]
    fn abandoned_recording_never_counts_as_in_flight() {
        let mut tracker = SlotTracker::default();
        tracker.begin_acquire(1).unwrap();
        tracker.begin_recording(1).unwrap();
        assert!(tracker.retire(1).is_err());
        tracker.abandon(1).unwrap();
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn failed_submit_recovers_through_empty_submission() {
        let mut tracker = SlotTracker::default();
        tracker.begin_acquire(0).unwrap();
        tracker.begin_recording(0).unwrap();

        // The empty submission owns the fence now: the slot is in flight and
        // can only be reused after its fence is waited on
        tracker.recover(0).unwrap();
        assert_eq!(tracker.state(0), SlotState::Submitted);
        assert_eq!(tracker.in_flight(), 1);
        assert!(tracker.begin_acquire(0).is_err());
        assert!(tracker.abandon(0).is_err());

        tracker.retire(0).unwrap();
        tracker.begin_acquire(0).unwrap();
        assert!(tracker.recover(0).is_err());
    }

    #[test]
    fn abandon_is_only_valid_while_recording() {
        let mut tracker = SlotTracker::default();
        assert!(tracker.abandon(2).is_err());

        tracker.begin_acquire(2).unwrap();
        assert!(tracker.abandon(2).is_err());
        tracker.begin_recording(2).unwrap();
        tracker.abandon(2).unwrap();

        // Fresh fence is signaled, so the slot starts over from Idle
        tracker.retire(2).unwrap();
        tracker.begin_acquire(2).unwrap();
    }

    #[test]
    fn submit_results_map_to_typed_errors() {
        let err = submit_error(vk::Result::ERROR_DEVICE_LOST, "render");
        assert!(crate::error::is_fatal(&err));

        let err = submit_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "render");
        assert!(!crate::error::is_fatal(&err));
        assert!(format!("{:#}", err).contains("render"));
    }

    #[test]
    fn fence_results_map_to_typed_errors() {
        let timeout = Duration::from_millis(250);

        let err = fence_wait_error(vk::Result::TIMEOUT, "render", timeout);
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::FenceTimeout { what: "render", .. })
        ));
        assert!(crate::error::is_fatal(&err));

        let err = fence_wait_error(vk::Result::ERROR_DEVICE_LOST, "transfer", timeout);
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::DeviceLost { what: "transfer" })
        ));

        let err = fence_wait_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY, "render", timeout);
        assert!(err.downcast_ref::<RenderError>().is_none());
        assert!(!crate::error::is_fatal(&err));
    }
}
