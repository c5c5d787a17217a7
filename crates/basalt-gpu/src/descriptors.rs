//! Descriptor set management.
//!
//! GPU-visible data is grouped by how often it changes; each
//! [`UsageFrequency`] owns one descriptor set whose layout is rebuilt
//! wholesale whenever a binding is registered. Registration happens only at
//! initialization, so the rebuild churn buys a guarantee: the layout and the
//! binding list can never disagree.

use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum descriptors of each type the shared pool can hand out.
const MAX_POOL_DESCRIPTORS: u32 = 64;
/// Maximum live descriptor sets per manager.
const MAX_POOL_SETS: u32 = 16;

/// How often the data behind a descriptor set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageFrequency {
    /// Refreshed once per frame (lights, camera constants).
    PerFrame,
    /// Refreshed per drawn object (transforms).
    PerObject,
    /// Bound once per material (textures, samplers).
    PerMaterial,
}

impl UsageFrequency {
    /// All frequency classes, in set-binding order.
    pub const ALL: [Self; 3] = [Self::PerFrame, Self::PerObject, Self::PerMaterial];
}

/// One usage-frequency slot: its bindings, derived layout, and allocated set.
struct DescriptorSlot {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

impl DescriptorSlot {
    fn empty() -> Self {
        Self {
            bindings: Vec::new(),
            layout: vk::DescriptorSetLayout::null(),
            set: vk::DescriptorSet::null(),
        }
    }
}

/// A descriptor write with the payload left for the caller to fill.
///
/// Separates "where to write" (set, binding, type — fixed at registration)
/// from "what to write" (a buffer range or image that changes every frame).
#[derive(Debug, Clone, Copy)]
pub struct WriteTemplate {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
}

impl WriteTemplate {
    /// Point the binding at a buffer range.
    ///
    /// # Safety
    /// Device and buffer must be valid, and the set must not be bound by an
    /// in-flight command buffer.
    pub unsafe fn write_buffer(
        &self,
        device: &ash::Device,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(range);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .buffer_info(std::slice::from_ref(&buffer_info));

        device.update_descriptor_sets(&[write], &[]);
    }

    /// Point the binding at a sampled image.
    ///
    /// # Safety
    /// Same contract as [`Self::write_buffer`].
    pub unsafe fn write_image(
        &self,
        device: &ash::Device,
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) {
        let image_info = vk::DescriptorImageInfo::default()
            .sampler(sampler)
            .image_view(view)
            .image_layout(layout);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .image_info(std::slice::from_ref(&image_info));

        device.update_descriptor_sets(&[write], &[]);
    }
}

/// Owns one descriptor pool and the per-frequency descriptor slots.
///
/// Multiple managers may coexist (one per shading technique); each has its
/// own pool and its own slots.
pub struct DescriptorManager {
    device: Arc<ash::Device>,
    pool: vk::DescriptorPool,
    slots: HashMap<UsageFrequency, DescriptorSlot>,
}

impl DescriptorManager {
    /// Create a manager with empty slots for every usage frequency.
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        tracing::debug!("Initializing descriptor manager");

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(MAX_POOL_DESCRIPTORS),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(MAX_POOL_DESCRIPTORS),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(MAX_POOL_DESCRIPTORS),
        ];

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_POOL_SETS)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };

        let slots = UsageFrequency::ALL
            .iter()
            .map(|frequency| (*frequency, DescriptorSlot::empty()))
            .collect();

        Ok(Self {
            device,
            pool,
            slots,
        })
    }

    /// Register a binding on a usage-frequency slot.
    ///
    /// Bindings are kept unique and sorted ascending by id, and the slot's
    /// layout and set are rebuilt from scratch. Registration is an
    /// initialization-time operation; calling this while the set is bound by
    /// in-flight work is a caller error.
    pub fn add_binding(
        &mut self,
        binding_id: u32,
        stages: vk::ShaderStageFlags,
        frequency: UsageFrequency,
        descriptor_type: vk::DescriptorType,
    ) -> Result<()> {
        let slot = self
            .slots
            .get_mut(&frequency)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown usage frequency {frequency:?}")))?;

        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(binding_id)
            .descriptor_type(descriptor_type)
            .descriptor_count(1)
            .stage_flags(stages);
        insert_binding(&mut slot.bindings, binding)?;

        unsafe {
            // Rebuild wholesale; no partial patching of an existing layout
            if slot.set != vk::DescriptorSet::null() {
                self.device.free_descriptor_sets(self.pool, &[slot.set])?;
            }
            if slot.layout != vk::DescriptorSetLayout::null() {
                self.device.destroy_descriptor_set_layout(slot.layout, None);
            }

            let layout_info =
                vk::DescriptorSetLayoutCreateInfo::default().bindings(&slot.bindings);
            slot.layout = self.device.create_descriptor_set_layout(&layout_info, None)?;

            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.pool)
                .set_layouts(std::slice::from_ref(&slot.layout));
            slot.set = self.device.allocate_descriptor_sets(&alloc_info)?[0];
        }

        Ok(())
    }

    /// Get the layout for a usage frequency.
    pub fn layout(&self, frequency: UsageFrequency) -> Result<vk::DescriptorSetLayout> {
        let slot = self.slot(frequency)?;
        if slot.layout == vk::DescriptorSetLayout::null() {
            return Err(GpuError::InvalidState(format!(
                "no bindings registered for {frequency:?}"
            )));
        }
        Ok(slot.layout)
    }

    /// Get the descriptor set for a usage frequency.
    pub fn set(&self, frequency: UsageFrequency) -> Result<vk::DescriptorSet> {
        let slot = self.slot(frequency)?;
        if slot.set == vk::DescriptorSet::null() {
            return Err(GpuError::InvalidState(format!(
                "no bindings registered for {frequency:?}"
            )));
        }
        Ok(slot.set)
    }

    /// Get a write template for a registered binding.
    ///
    /// Requesting a binding that was never registered is a programming error
    /// and fails, never a silent no-op.
    pub fn write_template(
        &self,
        frequency: UsageFrequency,
        binding_id: u32,
    ) -> Result<WriteTemplate> {
        let slot = self.slot(frequency)?;
        let binding = slot
            .bindings
            .iter()
            .find(|binding| binding.binding == binding_id)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "binding {binding_id} was never registered for {frequency:?}"
                ))
            })?;

        Ok(WriteTemplate {
            set: slot.set,
            binding: binding.binding,
            descriptor_type: binding.descriptor_type,
        })
    }

    fn slot(&self, frequency: UsageFrequency) -> Result<&DescriptorSlot> {
        self.slots
            .get(&frequency)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown usage frequency {frequency:?}")))
    }

    /// Destroy the layouts and the pool.
    ///
    /// # Safety
    /// The device must be valid and no set from this manager may be bound by
    /// in-flight work.
    pub unsafe fn destroy(&mut self) {
        for slot in self.slots.values_mut() {
            if slot.layout != vk::DescriptorSetLayout::null() {
                self.device.destroy_descriptor_set_layout(slot.layout, None);
                slot.layout = vk::DescriptorSetLayout::null();
            }
            slot.set = vk::DescriptorSet::null();
        }
        self.device.destroy_descriptor_pool(self.pool, None);
        self.pool = vk::DescriptorPool::null();
    }
}

/// Insert a binding keeping ids unique and sorted ascending.
///
/// Shader reflection assumes ascending binding order, so the ordering is an
/// invariant of the slot, not a convenience.
fn insert_binding(
    bindings: &mut Vec<vk::DescriptorSetLayoutBinding<'static>>,
    binding: vk::DescriptorSetLayoutBinding<'static>,
) -> Result<()> {
    if bindings.iter().any(|existing| existing.binding == binding.binding) {
        return Err(GpuError::InvalidState(format!(
            "binding {} is already registered on this slot",
            binding.binding
        )));
    }

    bindings.push(binding);
    bindings.sort_by_key(|binding| binding.binding);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(id: u32) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(id)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
    }

    #[test]
    fn bindings_sort_ascending_regardless_of_insertion_order() {
        let mut bindings = Vec::new();
        insert_binding(&mut bindings, binding(2)).unwrap();
        insert_binding(&mut bindings, binding(0)).unwrap();

        let ids: Vec<u32> = bindings.iter().map(|binding| binding.binding).collect();
        assert_eq!(ids, [0, 2]);
    }

    #[test]
    fn duplicate_binding_ids_are_rejected() {
        let mut bindings = Vec::new();
        insert_binding(&mut bindings, binding(1)).unwrap();
        let result = insert_binding(&mut bindings, binding(1));
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn binding_ids_stay_pairwise_distinct_and_sorted() {
        let mut bindings = Vec::new();
        for id in [5, 3, 8, 0, 4] {
            insert_binding(&mut bindings, binding(id)).unwrap();
        }

        let ids: Vec<u32> = bindings.iter().map(|binding| binding.binding).collect();
        assert_eq!(ids, [0, 3, 4, 5, 8]);
        for window in ids.windows(2) {
            assert!(window[0] < window[1]);
        }
    }
}
