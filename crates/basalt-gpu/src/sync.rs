//! Synchronization primitives.
//!
//! All waits in this crate are bounded. An expired bound surfaces as
//! [`GpuError::Timeout`] and is fatal at this layer: a fence that never
//! signals means the GPU stopped making progress, which is not recoverable
//! here.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence with a bounded timeout.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    match device.wait_for_fences(&[fence], true, timeout_ns) {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout("frame fence")),
        Err(e) => Err(GpuError::from(e)),
    }
}

/// Reset a fence to the unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Per-frame synchronization resources.
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready to be rendered to.
    pub image_available: vk::Semaphore,
    /// Signaled when rendering is complete and presentation may start.
    pub render_finished: vk::Semaphore,
    /// Signaled when the frame's submitted GPU work has fully retired.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources. The fence starts signaled so
    /// the first wait on a fresh slot passes immediately.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            image_available: create_semaphore(device)?,
            render_finished: create_semaphore(device)?,
            in_flight: create_fence(device, true)?,
        })
    }

    /// Wait for this frame's work to retire, with a bounded timeout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device, timeout_ns: u64) -> Result<()> {
        wait_for_fence(device, self.in_flight, timeout_ns)
    }

    /// Reset the fence for the next frame.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        reset_fence(device, self.in_flight)
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}
