use ash::vk;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{format_api_version, CallbackKind, VulkanConfig};
use crate::error::{HarnessError, Result, VkResultExt};
use crate::monitor::callback::{self, DebugSink};
use crate::monitor::Monitor;

pub const PORTABILITY_ENUMERATION: &str = "VK_KHR_portability_enumeration";
const ENUMERATE_PORTABILITY_FLAG: vk::InstanceCreateFlags = vk::InstanceCreateFlags::from_raw(0x1);

fn debug_extension_name(kind: CallbackKind) -> &'static CStr {
    match kind {
        CallbackKind::DebugReport => ash::extensions::ext::DebugReport::name(),
        CallbackKind::DebugUtils => ash::extensions::ext::DebugUtils::name(),
    }
}

/// Highest instance-level API version the loader supports.
pub fn loader_api_version(entry: &ash::Entry) -> u32 {
    match entry.try_enumerate_instance_version() {
        Ok(Some(version)) => version,
        _ => vk::API_VERSION_1_0,
    }
}

fn names_of(props: &[vk::ExtensionProperties]) -> Vec<String> {
    props
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_string_lossy().into_owned())
        .collect()
}

/// A Vulkan instance with the validation layer enabled and a debug sink
/// feeding a [`Monitor`].
pub struct HarnessInstance {
    entry: ash::Entry,
    raw: ash::Instance,
    sink: Option<DebugSink>,
    monitor: Arc<Monitor>,
    api_version: u32,
    enabled_extensions: Vec<String>,
}

impl HarnessInstance {
    /// Creates an instance that enables `config.validation_layer`, the debug
    /// extension selected by `config.callback` and `extensions`.
    ///
    /// An absent layer or extension is a [`HarnessError::MissingPrerequisite`];
    /// a failing `vkCreateInstance` is [`HarnessError::Fatal`].
    pub fn new(config: &VulkanConfig, extensions: &[String], monitor: Arc<Monitor>) -> Result<Arc<Self>> {
        let entry = unsafe { ash::Entry::load()? };
        let api_version = config.api_version()?;

        let loader_version = loader_api_version(&entry);
        if api_version > loader_version {
            return Err(HarnessError::MissingPrerequisite(format!(
                "API version {} (loader supports {})",
                format_api_version(api_version),
                format_api_version(loader_version)
            )));
        }

        let layer_name = CString::new(config.validation_layer.as_str())?;
        let layers = entry
            .enumerate_instance_layer_properties()
            .vk_context("vkEnumerateInstanceLayerProperties")?;
        let layer_present = layers
            .iter()
            .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == layer_name.as_c_str());
        if !layer_present {
            return Err(HarnessError::MissingPrerequisite(format!(
                "layer {}",
                config.validation_layer
            )));
        }

        let mut available = names_of(
            &entry
                .enumerate_instance_extension_properties(None)
                .vk_context("vkEnumerateInstanceExtensionProperties")?,
        );
        available.extend(names_of(
            &entry
                .enumerate_instance_extension_properties(Some(&layer_name))
                .vk_context("vkEnumerateInstanceExtensionProperties")?,
        ));

        let debug_ext = debug_extension_name(config.callback).to_string_lossy().into_owned();
        let mut wanted: Vec<String> = vec![debug_ext];
        for ext in extensions {
            if !wanted.contains(ext) {
                wanted.push(ext.clone());
            }
        }
        if let Some(missing) = wanted.iter().find(|ext| !available.contains(ext)) {
            return Err(HarnessError::MissingPrerequisite(format!(
                "instance extension {missing}"
            )));
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        if available.iter().any(|e| e == PORTABILITY_ENUMERATION) {
            debug!("Enabling {} for portability ICDs.", PORTABILITY_ENUMERATION);
            wanted.push(PORTABILITY_ENUMERATION.to_string());
            flags |= ENUMERATE_PORTABILITY_FLAG;
        }

        let app_name = CString::new(config.application_name.as_str())?;
        let eng_name = CString::new(config.engine_name.as_str())?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(1)
            .engine_name(&eng_name)
            .engine_version(1)
            .api_version(api_version);

        let ext_cstrings = wanted
            .iter()
            .map(|e| CString::new(e.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let ext_ptrs: Vec<*const c_char> = ext_cstrings.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs = [layer_name.as_ptr()];

        // Chained so that diagnostics raised by vkCreateInstance itself reach
        // the monitor.
        let mut report_info = callback::report_create_info(&monitor);
        let mut utils_info = callback::utils_create_info(&monitor);
        let mut create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&ext_ptrs);
        create_info = match config.callback {
            CallbackKind::DebugReport => create_info.push_next(&mut report_info),
            CallbackKind::DebugUtils => create_info.push_next(&mut utils_info),
        };

        let raw = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| HarnessError::Fatal(format!("vkCreateInstance failed: {e:?}")))?;
        info!(
            "Vulkan instance created (API {}, layer {}).",
            format_api_version(api_version),
            config.validation_layer
        );

        let sink = match unsafe { DebugSink::install(&entry, &raw, config.callback, &monitor) } {
            Ok(sink) => sink,
            Err(e) => {
                unsafe { raw.destroy_instance(None) };
                return Err(HarnessError::Fatal(format!("debug sink installation failed: {e}")));
            }
        };

        Ok(Arc::new(Self {
            entry,
            raw,
            sink: Some(sink),
            monitor,
            api_version,
            enabled_extensions: wanted,
        }))
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.iter().any(|e| e == name)
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.enabled_extensions
    }
}

impl std::fmt::Debug for HarnessInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessInstance")
            .field("handle", &self.raw.handle())
            .field("api_version", &format_api_version(self.api_version))
            .field("enabled_extensions", &self.enabled_extensions)
            .finish()
    }
}

impl Drop for HarnessInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some(sink) = self.sink.take() {
                sink.destroy();
            }
            self.raw.destroy_instance(None);
        }
        info!("Vulkan instance destroyed.");
    }
}
