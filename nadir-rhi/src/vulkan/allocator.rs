//! Dedicated-allocation image memory.
//!
//! Every image gets its own `vk::DeviceMemory`. The allocator remembers which
//! memory backs which image so `destroy_image` can release both.

use ash::vk;
use nadir_core::collections::hashmap::HashMap;
use nadir_core::log;
use parking_lot::Mutex;

use crate::error::{RhiError, RhiResult};
use crate::image::ImageDesc;
use crate::utility::find_memory_type;

pub(crate) struct MemoryAllocator {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocations: Mutex<HashMap<vk::Image, vk::DeviceMemory>>,
}

impl MemoryAllocator {
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            memory_properties,
            allocations: Mutex::new(HashMap::default()),
        }
    }

    #[profiling::function]
    pub fn create_image(&self, device: &ash::Device, desc: &ImageDesc) -> RhiResult<vk::Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None)? };

        match self.bind_memory(device, image, desc.memory_flags) {
            Ok(memory) => {
                self.allocations.lock().insert(image, memory);
                Ok(image)
            }
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    fn bind_memory(
        &self,
        device: &ash::Device,
        image: vk::Image,
        flags: vk::MemoryPropertyFlags,
    ) -> RhiResult<vk::DeviceMemory> {
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory_type_index = select_memory_type(&self.memory_properties, requirements.memory_type_bits, flags)
            .ok_or(RhiError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.allocate_memory(&alloc_info, None)? };

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe { device.free_memory(memory, None) };
            return Err(e.into());
        }

        Ok(memory)
    }

    pub fn destroy_image(&self, device: &ash::Device, image: vk::Image) {
        let memory = self.allocations.lock().remove(&image);
        unsafe {
            device.destroy_image(image, None);
            match memory {
                Some(memory) => device.free_memory(memory, None),
                None => log::warn!("Destroyed image {image:?} without a tracked allocation"),
            }
        }
    }

    /// Releases every image still alive. Called right before the device is destroyed.
    pub fn release_all(&self, device: &ash::Device) {
        let leaked: Vec<_> = self.allocations.lock().drain().collect();
        if !leaked.is_empty() {
            log::warn!("Releasing {} images that were never destroyed", leaked.len());
        }
        for (image, memory) in leaked {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().len()
    }
}

/// Memory type with the requested properties, or any allowed type when none has them.
fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    find_memory_type(memory_properties, type_filter, preferred).or_else(|| {
        log::debug!("No memory type with {preferred:?} in filter {type_filter:#b}, falling back");
        find_memory_type(memory_properties, type_filter, vk::MemoryPropertyFlags::empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;
        props
    }

    #[test]
    fn preferred_properties_win() {
        let props = properties();
        assert_eq!(select_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(1));
        assert_eq!(select_memory_type(&props, 0b101, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(2));
    }

    #[test]
    fn falls_back_to_any_allowed_type() {
        let props = properties();
        assert_eq!(select_memory_type(&props, 0b001, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(select_memory_type(&props, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL), None);
    }

    #[test]
    fn new_allocator_tracks_nothing() {
        let allocator = MemoryAllocator::new(properties());
        assert_eq!(allocator.allocation_count(), 0);
    }
}
