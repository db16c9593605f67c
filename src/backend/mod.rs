// Backend module - Vulkan abstraction layer
//
// Design: Thin RAII wrappers around ash. Every object holds an
// Arc<VulkanDevice> so the device outlives everything created from it.

pub mod barrier;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod sampler;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use memory::{AllocationSnapshot, GpuBuffer, GpuImage};
pub use surface::Surface;
pub use swapchain::Swapchain;
