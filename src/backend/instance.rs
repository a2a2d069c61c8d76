// Vulkan instance - entry point to the GPU
//
// Responsibilities:
// - Instance creation with the configured layers and extensions
// - Routing validation messages to the report sink
// - Physical device enumeration and selection (prefer discrete GPU)
// - Opening a logical device with compute (+ transfer) queues

use ash::{vk, Entry};
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use super::device::Device;
use super::driver::QueueFamilies;
use super::error::{Error, Result, VkResultExt};
use super::report::{Report, ReportSink};
use super::vulkan::VulkanDriver;
use crate::config::{DeviceConfig, InstanceConfig};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A GPU as reported by the loader, before a logical device is opened
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    pub handle: vk::PhysicalDevice,
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub compute_family: u32,
    /// Family with transfer but neither compute nor graphics, if any
    pub transfer_only_family: Option<u32>,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl PhysicalDevice {
    pub fn queue_families(&self, dedicated_transfer: bool) -> QueueFamilies {
        let transfer = match self.transfer_only_family {
            Some(family) if dedicated_transfer => family,
            _ => self.compute_family,
        };
        QueueFamilies {
            compute: self.compute_family,
            transfer,
        }
    }

    fn score(&self) -> u32 {
        match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
            _ => 1,
        }
    }
}

pub struct Instance {
    pub(crate) instance: ash::Instance,
    _entry: Entry,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Boxed so the messenger's user-data pointer stays valid
    sink: Box<Arc<dyn ReportSink>>,
}

impl Instance {
    /// Load Vulkan and create an instance from `config`
    pub fn new(config: &InstanceConfig, sink: Arc<dyn ReportSink>) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", config.application_name);

        // SAFETY: the loaded library stays alive as long as `entry`
        let entry = unsafe { Entry::load() }?;
        let instance = Self::create_instance(&entry, config)?;
        let sink = Box::new(sink);

        let debug_utils = if config.validation {
            match Self::setup_debug_messenger(&entry, &instance, &sink) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    // SAFETY: nothing was created from the instance yet
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            instance,
            _entry: entry,
            debug_utils,
            sink,
        }))
    }

    fn create_instance(entry: &Entry, config: &InstanceConfig) -> Result<ash::Instance> {
        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| Error::precondition("application name contains a NUL byte"))?;
        let engine_name = c"vk-dispatch";
        let [major, minor, patch] = config.application_version;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(config.api_version()?);

        let to_cstrings = |names: &[String]| -> Result<Vec<CString>> {
            names
                .iter()
                .map(|n| {
                    CString::new(n.as_str())
                        .map_err(|_| Error::precondition(format!("name {n:?} contains a NUL byte")))
                })
                .collect()
        };
        let layers = to_cstrings(&config.layers)?;
        let extensions = to_cstrings(&config.extensions)?;

        let mut layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();
        let mut extension_names: Vec<*const c_char> =
            extensions.iter().map(|e| e.as_ptr()).collect();
        if config.validation {
            layer_names.push(VALIDATION_LAYER.as_ptr());
            extension_names.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);

        // SAFETY: all pointers in create_info outlive the call
        unsafe { entry.create_instance(&create_info, None) }.context_vk("vkCreateInstance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        sink: &Arc<dyn ReportSink>,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(sink as *const Arc<dyn ReportSink> as *mut c_void);

        // SAFETY: the user-data pointer lives in a Box owned by the instance,
        // which destroys the messenger before dropping the box.
        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context_vk("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }

    pub fn sink(&self) -> &Arc<dyn ReportSink> {
        &self.sink
    }

    /// Every physical device with a compute-capable queue family
    pub fn devices(&self) -> Result<Vec<PhysicalDevice>> {
        // SAFETY: instance is valid for the lifetime of self
        let handles = unsafe { self.instance.enumerate_physical_devices() }
            .context_vk("vkEnumeratePhysicalDevices")?;

        let devices = handles
            .into_iter()
            .enumerate()
            .filter_map(|(index, handle)| self.describe(index, handle))
            .collect();
        Ok(devices)
    }

    fn describe(&self, index: usize, handle: vk::PhysicalDevice) -> Option<PhysicalDevice> {
        // SAFETY: handle came from this instance
        let (props, families, memory_properties) = unsafe {
            (
                self.instance.get_physical_device_properties(handle),
                self.instance
                    .get_physical_device_queue_family_properties(handle),
                self.instance.get_physical_device_memory_properties(handle),
            )
        };

        let compute_family = families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))?
            as u32;
        let transfer_only_family = families
            .iter()
            .position(|f| {
                f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                    && !f
                        .queue_flags
                        .intersects(vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS)
            })
            .map(|i| i as u32);

        // SAFETY: device_name is a NUL-terminated array filled by the driver
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Some(PhysicalDevice {
            handle,
            index,
            name,
            device_type: props.device_type,
            api_version: props.api_version,
            compute_family,
            transfer_only_family,
            memory_properties,
        })
    }

    /// Pick a physical device according to `config`
    pub fn select_device(&self, config: &DeviceConfig) -> Result<PhysicalDevice> {
        let devices = self.devices()?;
        if let Some(index) = config.index {
            return devices
                .into_iter()
                .find(|d| d.index == index)
                .ok_or(Error::NoSuitableDevice);
        }

        let preferred = config.preferred_type();
        devices
            .into_iter()
            .max_by_key(|d| {
                let bonus = if Some(d.device_type) == preferred { 10_000 } else { 0 };
                bonus + d.score()
            })
            .ok_or(Error::NoSuitableDevice)
    }

    /// Open `physical` as a logical device
    pub fn create_device(
        self: &Arc<Self>,
        physical: &PhysicalDevice,
        dedicated_transfer: bool,
    ) -> Result<Arc<Device>> {
        let families = physical.queue_families(dedicated_transfer);
        log::info!("Selected GPU: {}", physical.name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(physical.api_version),
            vk::api_version_minor(physical.api_version),
            vk::api_version_patch(physical.api_version)
        );

        let driver = VulkanDriver::new(self.clone(), physical, families)?;
        Device::new(Arc::new(driver), Arc::clone(&self.sink))
    }

    /// Select and open a device in one step
    pub fn default_device(self: &Arc<Self>, config: &DeviceConfig) -> Result<Arc<Device>> {
        let physical = self.select_device(config)?;
        self.create_device(&physical, config.dedicated_transfer)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");

        // SAFETY: every device created from this instance holds an Arc to it,
        // so none are alive any more.
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Validation messages are forwarded to the instance's report sink
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }
    let data = &*p_callback_data;
    let sink = &*(p_user_data as *const Arc<dyn ReportSink>);

    let message = if data.p_message.is_null() {
        Default::default()
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };
    let prefix = if data.p_message_id_name.is_null() {
        "Vulkan".into()
    } else {
        CStr::from_ptr(data.p_message_id_name).to_string_lossy()
    };

    let flags = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => vk::DebugReportFlagsEXT::ERROR,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) =>
        {
            vk::DebugReportFlagsEXT::PERFORMANCE_WARNING
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => vk::DebugReportFlagsEXT::WARNING,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => vk::DebugReportFlagsEXT::INFORMATION,
        _ => vk::DebugReportFlagsEXT::DEBUG,
    };

    let mut report = Report::new(flags, &prefix, &message);
    report.message_code = data.message_id_number;
    if sink.report(&report) {
        vk::TRUE
    } else {
        vk::FALSE
    }
}
