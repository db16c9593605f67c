// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. Compiled `.spv` files are read
// from the shader directory at startup and checked before they reach the
// driver.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::RenderError;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

pub const GBUFFER_VERT: &str = "gbuffer.vert.spv";
pub const GBUFFER_FRAG: &str = "gbuffer.frag.spv";
pub const SHADING_COMP: &str = "shading.comp.spv";

fn invalid(path: &Path, reason: impl Into<String>) -> RenderError {
    RenderError::InvalidShader {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Validate and convert raw bytes to SPIR-V words
pub fn parse_spirv(path: &Path, bytes: &[u8]) -> Result<Vec<u32>, RenderError> {
    if bytes.is_empty() {
        return Err(invalid(path, "file is empty"));
    }
    if bytes.len() % 4 != 0 {
        return Err(invalid(path, format!("length {} is not a multiple of 4", bytes.len())));
    }

    // read_spv handles alignment and byte order (a byte-swapped magic is
    // accepted and swapped back)
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| invalid(path, e.to_string()))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&magic) => Err(invalid(path, format!("bad magic number {:#010x}", magic))),
        None => Err(invalid(path, "file is empty")),
    }
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>, RenderError> {
    let bytes = std::fs::read(path).map_err(|e| invalid(path, e.to_string()))?;
    parse_spirv(path, &bytes)
}

/// RAII shader module; only needed until the pipeline is built
pub struct ShaderModule {
    device: Arc<VulkanDevice>,
    pub module: vk::ShaderModule,
    pub path: PathBuf,
}

impl ShaderModule {
    /// Load `<dir>/<name>` and create the module
    pub fn load(device: &Arc<VulkanDevice>, dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let code = load_spirv(&path)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module from {:?}", path))?;

        log::debug!("Loaded shader {:?} ({} words)", path, code.len());

        Ok(Self {
            device: device.clone(),
            module,
            path,
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_valid_header() {
        let bytes = module(&[SPIRV_MAGIC, 0x0001_0600, 0, 8, 0]);
        let words = parse_spirv(Path::new("ok.spv"), &bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn rejects_truncated_file() {
        let mut bytes = module(&[SPIRV_MAGIC, 0x0001_0600]);
        bytes.pop();
        let err = parse_spirv(Path::new("short.spv"), &bytes).unwrap_err();
        assert!(err.to_string().contains("multiple of 4"));
        assert!(err.to_string().contains("short.spv"));
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = module(&[0xDEAD_BEEF, 0x0001_0600]);
        assert!(matches!(
            parse_spirv(Path::new("bad.spv"), &bytes),
            Err(RenderError::InvalidShader { .. })
        ));
    }

    #[test]
    fn rejects_empty_file() {
        assert!(parse_spirv(Path::new("empty.spv"), &[]).is_err());
    }

    #[test]
    fn missing_file_is_invalid_shader() {
        let err = load_spirv(Path::new("no/such/dir/gbuffer.vert.spv")).unwrap_err();
        match err {
            RenderError::InvalidShader { path, .. } => {
                assert_eq!(path, PathBuf::from("no/such/dir/gbuffer.vert.spv"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
