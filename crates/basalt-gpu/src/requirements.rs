//! Declarative physical-device requirements.
//!
//! A [`DeviceRequirements`] value describes what a physical device must offer
//! without naming a specific GPU: unset property fields are wildcards, the
//! feature set is a structural sub-bitset test, and extensions are matched by
//! name. Callers that need strict pinning set the optional fields; everyone
//! else gets the first device that satisfies the features and extensions.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;

/// Requirements a physical device must meet to be selected.
#[derive(Default, Clone)]
pub struct DeviceRequirements {
    /// Required device type (e.g. discrete). `None` matches any type.
    pub device_type: Option<vk::PhysicalDeviceType>,
    /// Minimum API version the device must support. `None` matches any.
    pub min_api_version: Option<u32>,
    /// Required PCI vendor id. `None` matches any vendor.
    pub vendor_id: Option<u32>,
    /// Required PCI device id. `None` matches any device.
    pub device_id: Option<u32>,
    /// Features the device must advertise. Only features enabled here are
    /// checked; everything left at `FALSE` is a don't-care.
    pub features: vk::PhysicalDeviceFeatures,
    /// Device extensions that must be present, matched by name.
    pub extensions: Vec<&'static CStr>,
}

impl DeviceRequirements {
    /// Requirements for presenting to a surface: the swapchain extension and
    /// nothing else.
    pub fn presentation() -> Self {
        Self {
            extensions: vec![ash::khr::swapchain::NAME],
            ..Self::default()
        }
    }

    /// Check the explicitly-set property fields against a device's properties.
    ///
    /// Unset fields are treated as wildcards; the API version is a floor, the
    /// rest are exact matches.
    pub fn matches_properties(&self, properties: &vk::PhysicalDeviceProperties) -> bool {
        if let Some(device_type) = self.device_type {
            if device_type != properties.device_type {
                return false;
            }
        }
        if let Some(min_api_version) = self.min_api_version {
            if properties.api_version < min_api_version {
                return false;
            }
        }
        if let Some(vendor_id) = self.vendor_id {
            if vendor_id != properties.vendor_id {
                return false;
            }
        }
        if let Some(device_id) = self.device_id {
            if device_id != properties.device_id {
                return false;
            }
        }
        true
    }

    /// Check that every required feature is advertised by the device.
    pub fn matches_features(&self, available: &vk::PhysicalDeviceFeatures) -> bool {
        features_superset(&self.features, available)
    }

    /// Check that every required extension name appears in the device's
    /// extension list.
    pub fn matches_extensions(&self, available: &[vk::ExtensionProperties]) -> bool {
        self.extensions.iter().all(|required| {
            available.iter().any(|props| {
                let name = unsafe { CStr::from_ptr(props.extension_name.as_ptr()) };
                name == *required
            })
        })
    }
}

/// View a feature struct as its underlying array of boolean flags.
///
/// `vk::PhysicalDeviceFeatures` is a `repr(C)` struct of `Bool32` fields, so
/// the whole-struct sub-bitset test reduces to a per-flag comparison.
fn feature_flags(features: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    const FLAG_COUNT: usize =
        std::mem::size_of::<vk::PhysicalDeviceFeatures>() / std::mem::size_of::<vk::Bool32>();
    unsafe {
        std::slice::from_raw_parts(
            (features as *const vk::PhysicalDeviceFeatures).cast::<vk::Bool32>(),
            FLAG_COUNT,
        )
    }
}

/// `true` if every feature enabled in `required` is enabled in `available`.
pub fn features_superset(
    required: &vk::PhysicalDeviceFeatures,
    available: &vk::PhysicalDeviceFeatures,
) -> bool {
    feature_flags(required)
        .iter()
        .zip(feature_flags(available))
        .all(|(required, available)| *required == vk::FALSE || *available == vk::TRUE)
}

/// Select the first physical device meeting the requirements.
///
/// There is deliberately no scoring or fallback: a host that cannot satisfy
/// the requirements is an initialization failure, not a reason to silently
/// pick a weaker device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    requirements: &DeviceRequirements,
) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    for device in devices {
        let properties = instance.get_physical_device_properties(device);
        let features = instance.get_physical_device_features(device);
        let extensions = instance
            .enumerate_device_extension_properties(device)
            .unwrap_or_default();

        if requirements.matches_properties(&properties)
            && requirements.matches_features(&features)
            && requirements.matches_extensions(&extensions)
        {
            let name = CStr::from_ptr(properties.device_name.as_ptr());
            tracing::info!("Selected physical device: {}", name.to_string_lossy());
            return Ok(device);
        }
    }

    Err(GpuError::Initialization(
        "no physical device meets the requested features, properties, and extensions".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_char;

    fn extension_props(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (i, byte) in name.to_bytes_with_nul().iter().enumerate() {
            props.extension_name[i] = *byte as c_char;
        }
        props
    }

    #[test]
    fn default_requirements_match_any_properties() {
        let requirements = DeviceRequirements::default();
        let integrated = vk::PhysicalDeviceProperties {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            ..Default::default()
        };
        assert!(requirements.matches_properties(&integrated));
    }

    #[test]
    fn discrete_requirement_rejects_integrated_device() {
        let requirements = DeviceRequirements {
            device_type: Some(vk::PhysicalDeviceType::DISCRETE_GPU),
            ..Default::default()
        };
        let integrated = vk::PhysicalDeviceProperties {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            ..Default::default()
        };
        assert!(!requirements.matches_properties(&integrated));
    }

    #[test]
    fn api_version_is_a_floor() {
        let requirements = DeviceRequirements {
            min_api_version: Some(vk::API_VERSION_1_2),
            ..Default::default()
        };
        let older = vk::PhysicalDeviceProperties {
            api_version: vk::API_VERSION_1_1,
            ..Default::default()
        };
        let newer = vk::PhysicalDeviceProperties {
            api_version: vk::API_VERSION_1_3,
            ..Default::default()
        };
        assert!(!requirements.matches_properties(&older));
        assert!(requirements.matches_properties(&newer));
    }

    #[test]
    fn feature_superset_requires_every_enabled_flag() {
        let required = vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let full = vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            tessellation_shader: vk::TRUE,
            ..Default::default()
        };
        let partial = vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            ..Default::default()
        };
        assert!(features_superset(&required, &full));
        assert!(!features_superset(&required, &partial));
    }

    #[test]
    fn empty_feature_requirement_matches_anything() {
        let none = vk::PhysicalDeviceFeatures::default();
        assert!(features_superset(&none, &none));
    }

    #[test]
    fn extension_membership_is_matched_by_name() {
        let requirements = DeviceRequirements::presentation();
        let with_swapchain = [
            extension_props(c"VK_KHR_synchronization2"),
            extension_props(ash::khr::swapchain::NAME),
        ];
        let without = [extension_props(c"VK_KHR_synchronization2")];
        assert!(requirements.matches_extensions(&with_swapchain));
        assert!(!requirements.matches_extensions(&without));
    }
}
