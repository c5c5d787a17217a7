//! GPU context management.

use crate::config::GpuConfig;
use crate::error::{GpuError, Result};
use crate::instance::create_instance;
use crate::memory::MemoryFactory;
use crate::requirements::{select_physical_device, DeviceRequirements};
use ash::vk;
use std::sync::Arc;

/// Main GPU context holding the instance, device, and queue.
///
/// The context is the single long-lived owner of the logical device; every
/// other component borrows it (or clones the inner device `Arc`) and must be
/// torn down before the context drops.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,

    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,

    // Cached physical-device queries
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) limits: vk::PhysicalDeviceLimits,

    pub(crate) config: GpuConfig,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get a shared handle to the device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the cached memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Get the cached device limits.
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    /// Get the configuration the context was built with.
    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    /// Find a memory type allowed by `type_bits` whose property flags cover
    /// `required`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        find_memory_type(&self.memory_properties, type_bits, required)
    }

    /// Create a memory factory for allocating buffers and images.
    pub fn memory_factory(&self) -> MemoryFactory {
        MemoryFactory::new(self.device.clone(), self.memory_properties, self.limits)
    }

    /// Wait for the device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    config: GpuConfig,
    requirements: DeviceRequirements,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            config: GpuConfig::default(),
            requirements: DeviceRequirements::presentation(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: GpuConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the device requirements.
    pub fn requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Initialization(format!("failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.config) }?;

        let physical_device = unsafe { select_physical_device(&instance, &self.requirements) }?;

        let (memory_properties, limits) = unsafe {
            let properties = instance.get_physical_device_properties(physical_device);
            (
                instance.get_physical_device_memory_properties(physical_device),
                properties.limits,
            )
        };

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let graphics_queue_family = find_graphics_queue_family(&queue_families)?;

        let device = unsafe {
            create_device(
                &instance,
                physical_device,
                graphics_queue_family,
                &self.requirements,
            )?
        };
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        tracing::info!(
            "Created logical device (graphics queue family {})",
            graphics_queue_family
        );

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device: Arc::new(device),
            graphics_queue_family,
            graphics_queue,
            memory_properties,
            limits,
            config: self.config,
        })
    }
}

/// Find the first queue family advertising graphics support.
pub fn find_graphics_queue_family(families: &[vk::QueueFamilyProperties]) -> Result<u32> {
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
        .ok_or_else(|| {
            GpuError::Initialization("no queue family supports graphics operations".into())
        })
}

/// Find a memory type allowed by `type_bits` whose property flags are a
/// superset of `required`.
///
/// There is no fallback path: returning a type with fewer properties than
/// requested would break host-visibility or performance assumptions, so a
/// miss is an [`GpuError::InvalidState`].
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    for index in 0..memory_properties.memory_type_count {
        let allowed = type_bits & (1 << index) != 0;
        let flags = memory_properties.memory_types[index as usize].property_flags;
        if allowed && flags.contains(required) {
            return Ok(index);
        }
    }

    Err(GpuError::InvalidState(format!(
        "no memory type in mask {type_bits:#b} has properties {required:?}"
    )))
}

/// Create the logical device with one graphics queue.
///
/// All features the physical device advertises are enabled; there is no
/// fine-grained feature trimming.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
    requirements: &DeviceRequirements,
) -> Result<ash::Device> {
    // Lowest priority for now
    let queue_priorities = [0.0_f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&queue_priorities);

    let extension_names: Vec<*const i8> = requirements
        .extensions
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let features = instance.get_physical_device_features(physical_device);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(|e| GpuError::Initialization(format!("logical device creation failed: {e}")))?;

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn memory_properties(
        types: &[vk::MemoryPropertyFlags],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (index, flags) in types.iter().enumerate() {
            properties.memory_types[index].property_flags = *flags;
        }
        properties
    }

    #[test]
    fn first_graphics_family_is_selected() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(find_graphics_queue_family(&families).unwrap(), 1);
    }

    #[test]
    fn missing_graphics_family_fails_initialization() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            find_graphics_queue_family(&families),
            Err(GpuError::Initialization(_))
        ));
    }

    #[test]
    fn memory_type_must_cover_all_requested_flags() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index = find_memory_type(
            &properties,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn memory_type_respects_the_allowed_mask() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        // Type 0 qualifies but is excluded by the mask
        let index =
            find_memory_type(&properties, 0b10, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn unsatisfiable_memory_request_is_invalid_state() {
        let properties = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let result = find_memory_type(&properties, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }
}
