//! Instance creation, validation messenger, physical device selection and logical device setup.

use std::ffi::{c_char, CStr};

use ash::{vk, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use nadir_core::log;

use crate::backend::QueueFamilyInfo;
use crate::error::{RhiError, RhiResult};

#[cfg(feature = "validation")]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Scoring weights for physical device selection.
const SCORE_DISCRETE_GPU: u32 = 10000;
const SCORE_INTEGRATED_GPU: u32 = 1000;
const SCORE_PER_GB_VRAM: u32 = 100;
const SCORE_VULKAN_1_4: u32 = 600;
const SCORE_VULKAN_1_3: u32 = 400;
const SCORE_VULKAN_1_2: u32 = 200;

/// Debug utils loader and the messenger it owns.
#[cfg(feature = "validation")]
pub(crate) struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

#[cfg(feature = "validation")]
impl DebugMessenger {
    pub unsafe fn destroy(&self) {
        unsafe { self.loader.destroy_debug_utils_messenger(self.messenger, None) };
    }
}

/// The physical device picked for the backend and everything learned about it.
pub(crate) struct SelectedDevice {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<QueueFamilyInfo>,
}

/// Create the instance. With a display handle the platform surface extensions are enabled.
///
/// Returns whether the validation layer was actually enabled.
pub(crate) fn create_instance(
    entry: &Entry,
    app_name: &CStr,
    display_handle: Option<RawDisplayHandle>,
    validation: bool,
) -> RhiResult<(Instance, bool)> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"Nadir")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions: Vec<*const c_char> = match display_handle {
        Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
        None => Vec::new(),
    };

    let validation = validation && validation_layer_available(entry);
    let mut layers: Vec<*const c_char> = Vec::new();

    #[cfg(feature = "validation")]
    if validation {
        layers.push(VALIDATION_LAYER.as_ptr());
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok((instance, validation))
}

#[cfg(feature = "validation")]
fn validation_layer_available(entry: &Entry) -> bool {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let available = layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));

    if !available {
        log::warn!("{VALIDATION_LAYER:?} requested but not installed, continuing without validation");
    }
    available
}

#[cfg(not(feature = "validation"))]
fn validation_layer_available(_entry: &Entry) -> bool {
    false
}

#[cfg(feature = "validation")]
pub(crate) fn setup_debug_messenger(entry: &Entry, instance: &Instance) -> RhiResult<DebugMessenger> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };

    Ok(DebugMessenger { loader, messenger })
}

#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { (*p_callback_data).message_as_c_str() }
        .map(CStr::to_string_lossy)
        .unwrap_or_default();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("Vulkan {type_str}: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("Vulkan {type_str}: {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("Vulkan {type_str}: {message}"),
        _ => log::debug!("Vulkan {type_str}: {message}"),
    }

    vk::FALSE
}

/// Queue families of `physical_device`, with present support probed against `surface`.
fn query_queue_families(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> Vec<QueueFamilyInfo> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families
        .iter()
        .enumerate()
        .map(|(index, family)| {
            let index = index as u32;
            let present_supported = surface.is_some_and(|(loader, surface)| unsafe {
                loader
                    .get_physical_device_surface_support(physical_device, index, surface)
                    .unwrap_or(false)
            });
            QueueFamilyInfo {
                index,
                flags: family.queue_flags,
                queue_count: family.queue_count,
                present_supported,
            }
        })
        .collect()
}

/// Whether the families cover what the backend needs: graphics, plus present when there is a surface.
fn has_required_queues(families: &[QueueFamilyInfo], needs_present: bool) -> bool {
    let graphics = families
        .iter()
        .any(|f| f.queue_count > 0 && f.flags.contains(vk::QueueFlags::GRAPHICS));
    let present = !needs_present || families.iter().any(|f| f.queue_count > 0 && f.present_supported);
    graphics && present
}

/// Calculate a score for the physical device (higher is better).
fn score_physical_device(
    properties: &vk::PhysicalDeviceProperties,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    has_required_queues: bool,
) -> u32 {
    if !has_required_queues {
        return 0;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => SCORE_DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU => SCORE_INTEGRATED_GPU,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 500,
        vk::PhysicalDeviceType::CPU => 100,
        _ => 10,
    };

    let api_version = properties.api_version;
    if api_version >= vk::make_api_version(0, 1, 4, 0) {
        score += SCORE_VULKAN_1_4;
    } else if api_version >= vk::API_VERSION_1_3 {
        score += SCORE_VULKAN_1_3;
    } else if api_version >= vk::API_VERSION_1_2 {
        score += SCORE_VULKAN_1_2;
    }

    let heap_count = (memory_properties.memory_heap_count as usize).min(vk::MAX_MEMORY_HEAPS);
    let vram_bytes: u64 = memory_properties.memory_heaps[..heap_count]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();

    let vram_gb = (vram_bytes / (1024 * 1024 * 1024)) as u32;
    score + vram_gb * SCORE_PER_GB_VRAM
}

/// Select the best physical device.
pub(crate) fn select_physical_device(
    instance: &Instance,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> RhiResult<SelectedDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    let mut best: Option<(u32, SelectedDevice)> = None;

    for handle in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(handle) };
        let queue_families = query_queue_families(instance, handle, surface);

        let usable = has_required_queues(&queue_families, surface.is_some());
        let score = score_physical_device(&properties, &memory_properties, usable);

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        log::info!("Found GPU: {} (score: {}, type: {:?})", name, score, properties.device_type);

        if score > best.as_ref().map_or(0, |(best_score, _)| *best_score) {
            best = Some((score, SelectedDevice { handle, name, memory_properties, queue_families }));
        }
    }

    best.map(|(_, device)| device).ok_or(RhiError::NoSuitableGpu)
}

/// Create the logical device with every queue of every family.
pub(crate) fn create_logical_device(
    instance: &Instance,
    selected: &SelectedDevice,
    enable_swapchain: bool,
) -> RhiResult<ash::Device> {
    let priorities: Vec<Vec<f32>> = selected
        .queue_families
        .iter()
        .map(|family| vec![1.0; family.queue_count as usize])
        .collect();

    let queue_create_infos: Vec<_> = selected
        .queue_families
        .iter()
        .zip(&priorities)
        .filter(|(family, _)| family.queue_count > 0)
        .map(|(family, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family.index)
                .queue_priorities(priorities)
        })
        .collect();

    let mut extensions: Vec<*const c_char> = Vec::new();
    if enable_swapchain {
        extensions.push(ash::khr::swapchain::NAME.as_ptr());
    }

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions);

    let device = unsafe { instance.create_device(selected.handle, &create_info, None)? };
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, flags: vk::QueueFlags, present_supported: bool) -> QueueFamilyInfo {
        QueueFamilyInfo { index, flags, queue_count: 1, present_supported }
    }

    fn memory_with_vram(gigabytes: u64) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_heap_count = 1;
        props.memory_heaps[0].size = gigabytes * 1024 * 1024 * 1024;
        props.memory_heaps[0].flags = vk::MemoryHeapFlags::DEVICE_LOCAL;
        props
    }

    #[test]
    fn discrete_beats_integrated() {
        let memory = memory_with_vram(2);
        let mut discrete = vk::PhysicalDeviceProperties::default();
        discrete.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;
        discrete.api_version = vk::API_VERSION_1_2;
        let mut integrated = vk::PhysicalDeviceProperties::default();
        integrated.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        integrated.api_version = vk::API_VERSION_1_3;

        let discrete_score = score_physical_device(&discrete, &memory, true);
        assert_eq!(discrete_score, SCORE_DISCRETE_GPU + SCORE_VULKAN_1_2 + 2 * SCORE_PER_GB_VRAM);
        assert!(discrete_score > score_physical_device(&integrated, &memory, true));
    }

    #[test]
    fn missing_queues_make_device_unusable() {
        let mut props = vk::PhysicalDeviceProperties::default();
        props.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;
        assert_eq!(score_physical_device(&props, &memory_with_vram(8), false), 0);
    }

    #[test]
    fn present_only_required_with_surface() {
        let families = [family(0, vk::QueueFlags::GRAPHICS, false), family(1, vk::QueueFlags::TRANSFER, false)];
        assert!(has_required_queues(&families, false));
        assert!(!has_required_queues(&families, true));

        let families = [family(0, vk::QueueFlags::COMPUTE, true)];
        assert!(!has_required_queues(&families, true));
    }
}
