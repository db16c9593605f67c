// Renderer - deferred pipeline and frame loop
//
// Per frame: wait for the slot's fence, acquire a swapchain image, write the
// global UBO, record the G-buffer pass and the shading pass, submit, present.
// Maps are uploaded out of band on the transfer queue.

pub mod bindless;
pub mod gbuffer;
pub mod global_ubo;
pub mod map;
pub mod shading;
pub mod transfer;

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::command::{self, CommandPool};
use crate::backend::sampler::Sampler;
use crate::backend::sync::{
    submit_empty, submit_error, wait_for_fence, FrameCounter, FrameResources, SlotTracker,
    FRAMES_IN_FLIGHT,
};
use crate::backend::{AllocationSnapshot, Surface, Swapchain, VulkanDevice, VulkanInstance};
use crate::config::Config;
use crate::error::RenderError;
use crate::scene::{validate_map, FrameState, Primitive, Texture};

use bindless::BindlessRegistry;
use gbuffer::GBuffer;
use global_ubo::{GlobalUbo, GlobalUniforms};
use map::GpuMap;
use shading::{ShadingPass, PRESENT_WAIT_STAGE};
use transfer::{TransferEngine, UploadTracker};

/// Everything the renderer needs to know at creation
#[derive(Debug, Clone)]
pub struct RendererDesc {
    pub app_name: String,
    /// Request the validation layer (debug builds only)
    pub validation: bool,
    pub present_mode: vk::PresentModeKHR,
    pub preferred_gpu: Option<String>,
    pub max_bindless_textures: u32,
    pub fence_timeout: Duration,
    pub shader_dir: PathBuf,
}

impl Default for RendererDesc {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RendererDesc {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            validation: config.debug.validation_layers,
            present_mode: config.get_present_mode(),
            preferred_gpu: config.graphics.preferred_gpu.clone(),
            max_bindless_textures: config.graphics.max_bindless_textures,
            fence_timeout: config.fence_timeout(),
            shader_dir: config.graphics.shader_dir.clone(),
        }
    }
}

pub struct Renderer {
    // Fields drop top to bottom: GPU resources before the objects they
    // were created from
    map: Option<GpuMap>,
    shading: ShadingPass,
    gbuffer: GBuffer,
    texture_sampler: Sampler,
    bindless: BindlessRegistry,
    _global: GlobalUniforms,
    transfer: TransferEngine,
    frames: Vec<FrameResources>,
    command_pool: CommandPool,
    swapchain: Swapchain,
    _surface: Arc<Surface>,
    device: Arc<VulkanDevice>,
    instance: Arc<VulkanInstance>,

    counter: FrameCounter,
    slots: SlotTracker,
    upload: UploadTracker,
    fence_timeout: Duration,
    window_size: vk::Extent2D,
    needs_recreate: bool,
}

impl Renderer {
    pub fn new<W>(window: &W, width: u32, height: u32, desc: &RendererDesc) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .context("Window has no display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Window has no window handle")?
            .as_raw();

        let validation = desc.validation && cfg!(debug_assertions);
        let instance = Arc::new(VulkanInstance::new(&desc.app_name, display, validation)?);
        let surface = Arc::new(Surface::new(&instance, display, window_handle)?);
        let device = VulkanDevice::new(instance.clone(), &surface, desc.preferred_gpu.as_deref())?;

        let swapchain = Swapchain::new(device.clone(), surface.clone(), width, height, desc.present_mode)?;
        let extent = swapchain.extent;

        let command_pool = CommandPool::new(&device, device.graphics_queue_family)?;
        let global = GlobalUniforms::new(&device)?;

        let frames = command_pool
            .allocate(FRAMES_IN_FLIGHT as u32)?
            .into_iter()
            .enumerate()
            .map(|(slot, cmd)| {
                let (uniform_buffer, uniform_set) = global.create_frame_binding(&device, slot)?;
                FrameResources::new(&device, cmd, uniform_buffer, uniform_set)
            })
            .collect::<Result<Vec<_>>>()?;

        let transfer = TransferEngine::new(&device, desc.fence_timeout)?;
        let bindless = BindlessRegistry::new(&device, desc.max_bindless_textures)?;
        let texture_sampler = Sampler::linear(&device)?;

        let gbuffer = GBuffer::new(
            &device,
            &desc.shader_dir,
            extent,
            global.layout.layout,
            bindless.layout.layout,
        )?;
        let shading = ShadingPass::new(
            &device,
            &desc.shader_dir,
            global.layout.layout,
            &gbuffer.targets,
            extent,
        )?;

        log::info!("Renderer ready ({} frames in flight)", FRAMES_IN_FLIGHT);

        Ok(Self {
            map: None,
            shading,
            gbuffer,
            texture_sampler,
            bindless,
            _global: global,
            transfer,
            frames,
            command_pool,
            swapchain,
            _surface: surface,
            device,
            instance,
            counter: FrameCounter::default(),
            slots: SlotTracker::default(),
            upload: UploadTracker::default(),
            fence_timeout: desc.fence_timeout,
            window_size: vk::Extent2D { width, height },
            needs_recreate: false,
        })
    }

    /// Replace the loaded level. Nothing is touched on the GPU when the map
    /// is rejected; otherwise the old map is released and the new one is
    /// uploaded with a single transfer submission.
    pub fn push_map(&mut self, primitives: &[Primitive], textures: &[Texture]) -> Result<()> {
        validate_map(primitives, textures, self.bindless.slots.capacity())?;

        self.transfer.wait()?;
        self.destroy_current_map()?;

        let cmd = self.transfer.begin()?;
        let map = GpuMap::record_upload(&self.device, cmd, primitives, textures)?;
        self.transfer.submit()?;
        self.upload.submitted()?;

        let views = map.texture_views();
        log::info!(
            "Map pushed: {} primitives, {} textures",
            map.primitives.len(),
            map.textures.len()
        );
        self.map = Some(map);

        if let Err(e) = self.bindless.bind_textures(&views, self.texture_sampler.sampler) {
            log::error!("Failed to bind map textures: {:#}", e);
            self.destroy_current_map()?;
            return Err(e);
        }
        Ok(())
    }

    /// Release the loaded level once no frame in flight can reference it
    pub fn destroy_current_map(&mut self) -> Result<()> {
        if self.map.is_none() {
            return Ok(());
        }

        self.wait_all_frames()?;
        self.transfer.wait()?;

        self.map = None;
        self.upload.cleared();
        self.bindless.slots.reset();
        log::debug!("Map destroyed, {:?} live", self.device.stats().snapshot());
        Ok(())
    }

    fn wait_all_frames(&mut self) -> Result<()> {
        for (slot, frame) in self.frames.iter().enumerate() {
            wait_for_fence(&self.device.device, frame.render_fence, self.fence_timeout, "render")?;
            self.slots.retire(slot)?;
        }
        Ok(())
    }

    /// Render and present one frame. An out-of-date swapchain is recreated
    /// and the frame skipped; fence timeouts and device loss are fatal
    /// (see `error::is_fatal`).
    pub fn draw(&mut self, frame: &FrameState) -> Result<()> {
        if self.needs_recreate {
            self.recreate_swapchain()?;
        }
        if self.is_minimized() {
            return Ok(());
        }

        let slot = self.counter.slot();
        wait_for_fence(
            &self.device.device,
            self.frames[slot].render_fence,
            self.fence_timeout,
            "render",
        )?;
        self.slots.retire(slot)?;

        // First frame after a push: the upload must be complete before the
        // map is drawn, then its staging memory can go
        if self.upload.must_wait_before_draw() {
            self.transfer.wait()?;
            if let Some(map) = self.map.as_mut() {
                let released = map.release_staging();
                log::debug!("Released {} staging buffers", released);
            }
            self.upload.completed()?;
        }

        self.slots.begin_acquire(slot)?;
        let acquired = self
            .swapchain
            .acquire_next_image(self.frames[slot].present_semaphore, self.fence_timeout);
        let (image_index, suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                self.slots.abort_acquire(slot)?;
                if matches!(e.downcast_ref::<RenderError>(), Some(RenderError::SwapchainOutOfDate)) {
                    log::debug!("Swapchain out of date on acquire, skipping frame");
                    return self.recreate_swapchain();
                }
                return Err(e);
            }
        };
        if suboptimal {
            self.needs_recreate = true;
        }

        self.slots.begin_recording(slot)?;
        if let Err(e) = self.record_and_submit(slot, image_index, frame) {
            log::error!("Frame {} was not submitted: {:#}", self.counter.current(), e);
            self.gbuffer.discard_layouts();
            self.shading.discard_layouts();
            self.release_slot(slot)?;
            return Err(e);
        }
        self.slots.mark_submitted(slot)?;
        self.gbuffer.commit_layouts();
        self.shading.commit_layouts();

        let frame_resources = &self.frames[slot];
        let out_of_date = self.swapchain.present(
            self.device.graphics_queue,
            image_index,
            &[frame_resources.render_semaphore],
        )?;
        if out_of_date {
            self.needs_recreate = true;
        }

        self.counter.advance();
        Ok(())
    }

    fn record_and_submit(&mut self, slot: usize, image_index: u32, frame: &FrameState) -> Result<()> {
        let device = &self.device.device;
        let extent = self.swapchain.extent;
        let frame_resources = &mut self.frames[slot];

        let ubo = GlobalUbo::new(frame, extent);
        frame_resources
            .uniform_buffer
            .write(0, std::slice::from_ref(&ubo))?;

        let cmd = frame_resources.command_buffer;
        command::begin_one_time(device, cmd)?;

        self.gbuffer.record(
            cmd,
            frame_resources.uniform_set,
            self.bindless.set,
            self.map.as_ref(),
        );
        let swapchain_image = self
            .swapchain
            .images
            .get(image_index as usize)
            .copied()
            .context("Swapchain returned an unknown image index")?;
        self.shading.record(
            cmd,
            frame_resources.uniform_set,
            &self.gbuffer,
            self.counter.current(),
            swapchain_image,
            extent,
        );

        command::end(device, cmd)?;

        let wait_semaphores = [frame_resources.present_semaphore];
        let wait_stages = [PRESENT_WAIT_STAGE];
        let signal_semaphores = [frame_resources.render_semaphore];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .reset_fences(&[frame_resources.render_fence])
                .context("Failed to reset render fence")?;
            device
                .queue_submit(self.device.graphics_queue, &[submit_info], frame_resources.render_fence)
                .map_err(|result| submit_error(result, "render"))?;
        }
        Ok(())
    }

    /// Hand a slot whose frame never reached the queue back to the loop.
    /// The acquire semaphore is consumed by an empty submission that also
    /// signals the fence; if even that fails the fence is replaced. The
    /// acquired image is never presented, so the swapchain is rebuilt.
    fn release_slot(&mut self, slot: usize) -> Result<()> {
        self.needs_recreate = true;

        let frame = &self.frames[slot];
        match submit_empty(
            &self.device.device,
            self.device.graphics_queue,
            frame.present_semaphore,
            frame.render_fence,
        ) {
            Ok(()) => self.slots.recover(slot),
            Err(e) => {
                log::error!("Failed to release frame slot {}: {:#}", slot, e);
                self.frames[slot].replace_fence()?;
                self.slots.abandon(slot)
            }
        }
    }

    /// New window size; swapchain and G-buffer follow immediately
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.window_size = vk::Extent2D { width, height };
        self.recreate_swapchain()
    }

    fn is_minimized(&self) -> bool {
        self.window_size.width == 0 || self.window_size.height == 0
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        if self.is_minimized() {
            // Retried on the first draw after the window is restored
            self.needs_recreate = true;
            return Ok(());
        }

        self.device.wait_idle()?;
        for slot in 0..FRAMES_IN_FLIGHT {
            self.slots.retire(slot)?;
        }

        self.swapchain
            .recreate(self.window_size.width, self.window_size.height)?;

        let extent = self.swapchain.extent;
        if extent != self.gbuffer.extent() {
            self.gbuffer.resize(extent)?;
            self.shading.resize(&self.gbuffer.targets, extent)?;
        }

        self.needs_recreate = false;
        Ok(())
    }

    /// Number of frames submitted so far
    pub fn current_frame(&self) -> u64 {
        self.counter.current()
    }

    pub fn allocation_stats(&self) -> AllocationSnapshot {
        self.device.stats().snapshot()
    }

    pub fn primitive_count(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.primitives.len())
    }

    pub fn texture_count(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.textures.len())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn bindless_capacity(&self) -> u32 {
        self.bindless.slots.capacity()
    }

    pub fn validation_enabled(&self) -> bool {
        self.instance.validation_enabled()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer after {} frames", self.counter.current());
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", e);
        }
        log::debug!(
            "Releasing {} frame slots (queue family {})",
            self.frames.len(),
            self.command_pool.queue_family
        );
    }
}
