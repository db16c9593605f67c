// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (first discrete GPU passing every check)
// - Logical device with dynamic rendering + descriptor indexing
// - Graphics/compute queue and transfer queue
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::memory::AllocationStats;
use super::{Surface, VulkanInstance};
use crate::error::RenderError;

/// The only surface format the swapchain is built with
pub const SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Required device extensions with the core version that promoted them
pub const REQUIRED_DEVICE_EXTENSIONS: &[(&str, Option<u32>)] = &[
    ("VK_KHR_swapchain", None),
    ("VK_KHR_dynamic_rendering", Some(vk::API_VERSION_1_3)),
    ("VK_EXT_descriptor_indexing", Some(vk::API_VERSION_1_2)),
];

/// Extensions from `REQUIRED_DEVICE_EXTENSIONS` the device lacks, taking
/// promotion into core into account
pub fn missing_extensions(available: &[String], api_version: u32) -> Vec<&'static str> {
    REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .filter(|(name, promoted)| {
            let in_core = promoted.map_or(false, |version| api_version >= version);
            !in_core && !available.iter().any(|ext| ext == name)
        })
        .map(|(name, _)| *name)
        .collect()
}

/// Device features the bindless + dynamic rendering design depends on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSupport {
    pub dynamic_rendering: bool,
    pub descriptor_indexing: bool,
    pub runtime_descriptor_array: bool,
    pub partially_bound: bool,
    pub sampled_image_update_after_bind: bool,
    pub variable_descriptor_count: bool,
    pub non_uniform_sampled_image_indexing: bool,
}

impl FeatureSupport {
    pub fn all() -> Self {
        Self {
            dynamic_rendering: true,
            descriptor_indexing: true,
            runtime_descriptor_array: true,
            partially_bound: true,
            sampled_image_update_after_bind: true,
            variable_descriptor_count: true,
            non_uniform_sampled_image_indexing: true,
        }
    }

    pub fn missing(&self) -> Vec<&'static str> {
        let checks = [
            (self.dynamic_rendering, "dynamicRendering"),
            (self.descriptor_indexing, "descriptorIndexing"),
            (self.runtime_descriptor_array, "runtimeDescriptorArray"),
            (self.partially_bound, "descriptorBindingPartiallyBound"),
            (self.sampled_image_update_after_bind, "descriptorBindingSampledImageUpdateAfterBind"),
            (self.variable_descriptor_count, "descriptorBindingVariableDescriptorCount"),
            (self.non_uniform_sampled_image_indexing, "shaderSampledImageArrayNonUniformIndexing"),
        ];
        checks
            .iter()
            .filter(|(supported, _)| !supported)
            .map(|(_, name)| *name)
            .collect()
    }

    fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut features12)
                .push_next(&mut features13);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        }

        Self {
            dynamic_rendering: features13.dynamic_rendering == vk::TRUE,
            descriptor_indexing: features12.descriptor_indexing == vk::TRUE,
            runtime_descriptor_array: features12.runtime_descriptor_array == vk::TRUE,
            partially_bound: features12.descriptor_binding_partially_bound == vk::TRUE,
            sampled_image_update_after_bind: features12
                .descriptor_binding_sampled_image_update_after_bind
                == vk::TRUE,
            variable_descriptor_count: features12.descriptor_binding_variable_descriptor_count
                == vk::TRUE,
            non_uniform_sampled_image_indexing: features12
                .shader_sampled_image_array_non_uniform_indexing
                == vk::TRUE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Can present to the renderer's surface
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSelection {
    pub graphics_family: u32,
    pub transfer_family: u32,
}

impl QueueSelection {
    pub fn has_dedicated_transfer(&self) -> bool {
        self.graphics_family != self.transfer_family
    }
}

/// Graphics+compute family able to present, plus the most specialised
/// transfer family (falls back to the graphics family)
pub fn pick_queue_families(families: &[QueueFamilyInfo]) -> Option<QueueSelection> {
    let usable = |f: &QueueFamilyInfo| f.queue_count > 0;

    let graphics = families.iter().position(|f| {
        usable(f) && f.present && f.flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })?;

    let dedicated = families.iter().position(|f| {
        usable(f)
            && f.flags.contains(vk::QueueFlags::TRANSFER)
            && !f.flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    });
    let transfer_only_ish = families.iter().position(|f| {
        usable(f) && f.flags.contains(vk::QueueFlags::TRANSFER) && !f.flags.contains(vk::QueueFlags::GRAPHICS)
    });

    let transfer = dedicated.or(transfer_only_ish).unwrap_or(graphics);

    Some(QueueSelection {
        graphics_family: graphics as u32,
        transfer_family: transfer as u32,
    })
}

/// Largest COMBINED_IMAGE_SAMPLER array an update-after-bind set can hold.
/// Every element counts as both a sampled image and a sampler.
pub fn bindless_limit(props12: &vk::PhysicalDeviceVulkan12Properties) -> u32 {
    [
        props12.max_descriptor_set_update_after_bind_sampled_images,
        props12.max_per_stage_descriptor_update_after_bind_sampled_images,
        props12.max_descriptor_set_update_after_bind_samplers,
        props12.max_per_stage_descriptor_update_after_bind_samplers,
    ]
    .into_iter()
    .min()
    .unwrap_or(0)
}

/// Everything the selection policy looks at for one GPU
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub extensions: Vec<String>,
    pub features: FeatureSupport,
}

impl DeviceCandidate {
    /// Queue families to use, or why this device cannot run the renderer
    pub fn evaluate(&self) -> std::result::Result<QueueSelection, String> {
        if self.api_version < vk::API_VERSION_1_3 {
            return Err(format!(
                "Vulkan {}.{} < 1.3",
                vk::api_version_major(self.api_version),
                vk::api_version_minor(self.api_version)
            ));
        }

        let queues = pick_queue_families(&self.queue_families)
            .ok_or_else(|| "no queue family with graphics & compute that can present".to_string())?;

        if self.surface_formats.is_empty() {
            return Err("no surface format".to_string());
        }
        if !self.surface_formats.contains(&SURFACE_FORMAT) {
            return Err("no B8G8R8A8_UNORM / SRGB_NONLINEAR surface format".to_string());
        }

        let missing = missing_extensions(&self.extensions, self.api_version);
        if !missing.is_empty() {
            return Err(format!("missing extensions {}", missing.join(", ")));
        }

        let missing = self.features.missing();
        if !missing.is_empty() {
            return Err(format!("missing features {}", missing.join(", ")));
        }

        Ok(queues)
    }

    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

/// Selection policy: a GPU whose name contains `preferred` if given,
/// otherwise the first discrete GPU. Integrated GPUs are never picked
/// implicitly.
pub fn select_device(
    candidates: &[DeviceCandidate],
    preferred: Option<&str>,
) -> std::result::Result<(usize, QueueSelection), RenderError> {
    if candidates.is_empty() {
        return Err(RenderError::NoSuitableDevice("no GPU supporting Vulkan".to_string()));
    }

    let mut rejections = Vec::new();

    if let Some(preferred) = preferred {
        let needle = preferred.to_lowercase();
        for (i, candidate) in candidates.iter().enumerate() {
            if !candidate.name.to_lowercase().contains(&needle) {
                continue;
            }
            match candidate.evaluate() {
                Ok(queues) => return Ok((i, queues)),
                Err(reason) => rejections.push(format!("{}: {}", candidate.name, reason)),
            }
        }
        if rejections.is_empty() {
            rejections.push(format!("no GPU name contains `{}`", preferred));
        }
    } else {
        for (i, candidate) in candidates.iter().enumerate() {
            match candidate.evaluate() {
                Ok(_) if !candidate.is_discrete() => {
                    rejections.push(format!("{}: not a discrete GPU", candidate.name));
                }
                Ok(queues) => return Ok((i, queues)),
                Err(reason) => rejections.push(format!("{}: {}", candidate.name, reason)),
            }
        }
    }

    for rejection in &rejections {
        log::info!("Skipping {}", rejection);
    }
    Err(RenderError::NoSuitableDevice(rejections.join("; ")))
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<VulkanInstance>,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub transfer_queue: vk::Queue,
    pub transfer_queue_family: u32,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    /// Largest bindless sampled-image array the driver accepts
    pub bindless_limit: u32,

    stats: AllocationStats,
}

impl VulkanDevice {
    /// Pick a GPU for `surface` and create the logical device
    pub fn new(
        instance: Arc<VulkanInstance>,
        surface: &Surface,
        preferred_gpu: Option<&str>,
    ) -> Result<Arc<Self>> {
        let physical_devices = unsafe { instance.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        let candidates = physical_devices
            .iter()
            .map(|&pd| Self::describe(&instance.instance, surface, pd))
            .collect::<Result<Vec<_>>>()?;

        let (index, queues) = select_device(&candidates, preferred_gpu)?;
        let physical_device = physical_devices[index];
        let candidate = &candidates[index];

        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };

        log::info!("Selected GPU: {} ({:?})", candidate.name, candidate.device_type);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        if queues.has_dedicated_transfer() {
            log::info!("Using dedicated transfer queue family {}", queues.transfer_family);
        }

        let device = Self::create_logical_device(&instance.instance, physical_device, queues)?;

        let graphics_queue = unsafe { device.get_device_queue(queues.graphics_family, 0) };
        let transfer_queue = unsafe { device.get_device_queue(queues.transfer_family, 0) };

        let bindless_limit = Self::query_bindless_limit(&instance.instance, physical_device);

        let allocator = match Self::create_allocator(&instance.instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            graphics_queue,
            graphics_queue_family: queues.graphics_family,
            transfer_queue,
            transfer_queue_family: queues.transfer_family,
            properties,
            bindless_limit,
            stats: AllocationStats::default(),
        }))
    }

    fn describe(
        instance: &ash::Instance,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
    ) -> Result<DeviceCandidate> {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed GPU>".to_string());

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .context("Failed to enumerate device extensions")?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_string_lossy))
            .map(|name| name.into_owned())
            .collect();

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
            .iter()
            .enumerate()
            .map(|(i, family)| {
                Ok(QueueFamilyInfo {
                    flags: family.queue_flags,
                    queue_count: family.queue_count,
                    present: surface.supports_present(physical_device, i as u32)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // A device that cannot present to this surface simply reports no format
        let surface_formats = surface.formats(physical_device).unwrap_or_default();

        Ok(DeviceCandidate {
            name,
            device_type: props.device_type,
            api_version: props.api_version,
            queue_families,
            surface_formats,
            extensions,
            features: FeatureSupport::query(instance, physical_device),
        })
    }

    fn query_bindless_limit(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> u32 {
        let mut props12 = vk::PhysicalDeviceVulkan12Properties::default();
        {
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut props12);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
        }
        bindless_limit(&props12)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queues: QueueSelection,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut families = vec![queues.graphics_family];
        if queues.has_dedicated_transfer() {
            families.push(queues.transfer_family);
        }

        let queue_create_infos: Vec<_> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        // Dynamic rendering and descriptor indexing are core in 1.3/1.2,
        // only the swapchain needs its extension enabled
        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_variable_descriptor_count(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features12)
            .push_next(&mut features13);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    /// Lock the allocator; only held for the duration of one allocate/free
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn stats(&self) -> &AllocationStats {
        &self.stats
    }

    /// Queue families a resource touched by both queues must be shared with
    pub fn sharing_families(&self) -> Vec<u32> {
        if self.graphics_queue_family == self.transfer_queue_family {
            vec![self.graphics_queue_family]
        } else {
            vec![self.graphics_queue_family, self.transfer_queue_family]
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        let live = self.stats.live_allocations();
        if live > 0 {
            log::warn!("{} GPU allocations still alive at device teardown", live);
        }

        unsafe {
            // Allocator releases its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindless_limit_counts_samplers_too() {
        let mut props12 = vk::PhysicalDeviceVulkan12Properties::default();
        props12.max_descriptor_set_update_after_bind_sampled_images = 1_000_000;
        props12.max_per_stage_descriptor_update_after_bind_sampled_images = 500_000;
        props12.max_descriptor_set_update_after_bind_samplers = 1_000_000;
        props12.max_per_stage_descriptor_update_after_bind_samplers = 4000;
        assert_eq!(bindless_limit(&props12), 4000);

        props12.max_per_stage_descriptor_update_after_bind_samplers = 1_000_000;
        assert_eq!(bindless_limit(&props12), 500_000);
    }

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo { flags, queue_count: 1, present }
    }

    fn gpu(name: &str, device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            device_type,
            api_version: vk::API_VERSION_1_3,
            queue_families: vec![family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                true,
            )],
            surface_formats: vec![SURFACE_FORMAT],
            extensions: vec!["VK_KHR_swapchain".to_string()],
            features: FeatureSupport::all(),
        }
    }

    #[test]
    fn promoted_extensions_are_satisfied_by_core() {
        let available = vec!["VK_KHR_swapchain".to_string()];
        assert!(missing_extensions(&available, vk::API_VERSION_1_3).is_empty());
        assert_eq!(
            missing_extensions(&available, vk::API_VERSION_1_2),
            vec!["VK_KHR_dynamic_rendering"]
        );
        assert_eq!(
            missing_extensions(&[], vk::API_VERSION_1_3),
            vec!["VK_KHR_swapchain"]
        );
    }

    #[test]
    fn every_missing_feature_is_reported() {
        assert!(FeatureSupport::all().missing().is_empty());
        let features = FeatureSupport {
            partially_bound: false,
            dynamic_rendering: false,
            ..FeatureSupport::all()
        };
        assert_eq!(
            features.missing(),
            vec!["dynamicRendering", "descriptorBindingPartiallyBound"]
        );
    }

    #[test]
    fn graphics_family_must_also_compute_and_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, true),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
        ];
        let queues = pick_queue_families(&families).unwrap();
        assert_eq!(queues.graphics_family, 2);
        assert_eq!(queues.transfer_family, 2);
        assert!(!queues.has_dedicated_transfer());

        assert!(pick_queue_families(&families[..2]).is_none());
    }

    #[test]
    fn dedicated_transfer_family_is_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, true),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING, false),
        ];
        let queues = pick_queue_families(&families).unwrap();
        assert_eq!(queues.graphics_family, 0);
        assert_eq!(queues.transfer_family, 2);

        let async_compute_only = &families[..2];
        assert_eq!(pick_queue_families(async_compute_only).unwrap().transfer_family, 1);
    }

    #[test]
    fn empty_families_are_ignored() {
        let mut families = vec![
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        families[1].queue_count = 0;
        assert_eq!(pick_queue_families(&families).unwrap().transfer_family, 0);
    }

    #[test]
    fn first_discrete_gpu_wins_and_integrated_is_skipped() {
        let candidates = vec![
            gpu("Intel UHD 630", vk::PhysicalDeviceType::INTEGRATED_GPU),
            gpu("GeForce RTX 3070", vk::PhysicalDeviceType::DISCRETE_GPU),
            gpu("Radeon RX 6800", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        let (index, _) = select_device(&candidates, None).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn only_integrated_gpus_is_an_error() {
        let candidates = vec![gpu("Intel UHD 630", vk::PhysicalDeviceType::INTEGRATED_GPU)];
        let err = select_device(&candidates, None).unwrap_err();
        assert!(err.to_string().contains("not a discrete GPU"));
    }

    #[test]
    fn discrete_gpu_without_format_is_skipped() {
        let mut broken = gpu("GeForce GTX 750", vk::PhysicalDeviceType::DISCRETE_GPU);
        broken.surface_formats = vec![vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let good = gpu("GeForce RTX 3070", vk::PhysicalDeviceType::DISCRETE_GPU);

        let (index, _) = select_device(&[broken.clone(), good], None).unwrap();
        assert_eq!(index, 1);

        let err = select_device(&[broken], None).unwrap_err();
        assert!(err.to_string().contains("B8G8R8A8_UNORM"));
    }

    #[test]
    fn old_api_and_missing_features_are_rejected() {
        let mut old = gpu("Old GPU", vk::PhysicalDeviceType::DISCRETE_GPU);
        old.api_version = vk::API_VERSION_1_1;
        assert!(old.evaluate().unwrap_err().contains("1.1"));

        let mut no_bindless = gpu("No Bindless", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_bindless.features.variable_descriptor_count = false;
        assert!(no_bindless
            .evaluate()
            .unwrap_err()
            .contains("descriptorBindingVariableDescriptorCount"));
    }

    #[test]
    fn preferred_name_overrides_device_type() {
        let candidates = vec![
            gpu("GeForce RTX 3070", vk::PhysicalDeviceType::DISCRETE_GPU),
            gpu("Intel UHD 630", vk::PhysicalDeviceType::INTEGRATED_GPU),
        ];
        let (index, _) = select_device(&candidates, Some("intel")).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn unknown_preferred_name_is_an_error() {
        let candidates = vec![gpu("GeForce RTX 3070", vk::PhysicalDeviceType::DISCRETE_GPU)];
        let err = select_device(&candidates, Some("Radeon")).unwrap_err();
        assert!(err.to_string().contains("`Radeon`"));
    }

    #[test]
    fn no_devices_reports_a_reason() {
        let err = select_device(&[], None).unwrap_err();
        assert!(matches!(err, RenderError::NoSuitableDevice(ref msg) if !msg.is_empty()));
    }
}
