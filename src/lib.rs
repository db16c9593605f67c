// Maidenless - deferred Vulkan renderer
//
// backend:  RAII wrappers around ash objects (device, swapchain, memory, sync)
// renderer: G-buffer and shading passes, bindless textures, map uploads
// scene:    CPU-side map and frame data handed in by the game

pub mod backend;
pub mod config;
pub mod demo;
pub mod error;
pub mod renderer;
pub mod scene;

pub use config::Config;
pub use error::RenderError;
pub use renderer::{Renderer, RendererDesc};
pub use scene::{ActorTransform, Camera, FrameState, Primitive, Texture, Vertex};
