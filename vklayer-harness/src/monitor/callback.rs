//! C-ABI entry points registered with the debug extensions.

use ash::extensions::ext::{DebugReport, DebugUtils};
use ash::vk;
use std::borrow::Cow;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::{Classification, DiagnosticRecord, Disposition, Monitor, Severity};
use crate::config::CallbackKind;
use crate::error::{Result, VkResultExt};

unsafe fn lossy<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("")
    } else {
        CStr::from_ptr(ptr).to_string_lossy()
    }
}

unsafe fn monitor_from_user_data<'a>(user_data: *mut c_void) -> Option<&'a Monitor> {
    (user_data as *const Monitor).as_ref()
}

fn log_record(record: &DiagnosticRecord, classification: Classification) {
    if let Disposition::Absorbed(index) = classification.disposition {
        debug!(target: "vulkan", "[{}] absorbed by expectation {}: {}", record.severity, index, record.message);
        return;
    }
    match record.severity {
        Severity::Error => error!(target: "vulkan", "[{}] {}", record.layer_prefix, record.message),
        Severity::Warning | Severity::PerformanceWarning => {
            warn!(target: "vulkan", "[{}] {}", record.layer_prefix, record.message)
        }
        Severity::Info => info!(target: "vulkan", "[{}] {}", record.layer_prefix, record.message),
        Severity::Debug => trace!(target: "vulkan", "[{}] {}", record.layer_prefix, record.message),
    }
}

fn dispatch(monitor: Option<&Monitor>, record: &DiagnosticRecord) -> vk::Bool32 {
    let classification = match monitor {
        Some(monitor) => monitor.classify(record),
        None => Monitor::global().classify(record),
    };
    log_record(record, classification);
    if classification.abort_call {
        vk::TRUE
    } else {
        vk::FALSE
    }
}

/// `PFN_vkDebugReportCallbackEXT` feeding the monitor in `user_data`.
pub unsafe extern "system" fn debug_report_callback(
    flags: vk::DebugReportFlagsEXT,
    object_type: vk::DebugReportObjectTypeEXT,
    object: u64,
    _location: usize,
    message_code: i32,
    p_layer_prefix: *const c_char,
    p_message: *const c_char,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    let record = DiagnosticRecord::new(Severity::from_report_flags(flags), lossy(p_message))
        .with_layer_prefix(lossy(p_layer_prefix))
        .with_object(object_type, object)
        .with_message_code(message_code);
    dispatch(monitor_from_user_data(p_user_data), &record)
}

/// `PFN_vkDebugUtilsMessengerCallbackEXT` feeding the monitor in `user_data`.
pub unsafe extern "system" fn debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    let Some(data) = p_callback_data.as_ref() else {
        return vk::FALSE;
    };
    let mut record = DiagnosticRecord::new(
        Severity::from_utils(message_severity, message_types),
        lossy(data.p_message),
    )
    .with_message_id(lossy(data.p_message_id_name))
    .with_layer_prefix("Validation")
    .with_message_code(data.message_id_number);
    record.message_types = message_types;
    if data.object_count > 0 && !data.p_objects.is_null() {
        let object = &*data.p_objects;
        record.object_handle = object.object_handle;
    }
    dispatch(monitor_from_user_data(p_user_data), &record)
}

/// Severities requested from `VK_EXT_debug_report`.
pub fn report_flags() -> vk::DebugReportFlagsEXT {
    vk::DebugReportFlagsEXT::ERROR
        | vk::DebugReportFlagsEXT::WARNING
        | vk::DebugReportFlagsEXT::PERFORMANCE_WARNING
}

/// Create info for a debug-report callback bound to `monitor`.
///
/// The returned struct holds a raw pointer to the monitor; the caller keeps
/// the `Arc` alive for as long as the callback is registered.
pub fn report_create_info(monitor: &Arc<Monitor>) -> vk::DebugReportCallbackCreateInfoEXT {
    vk::DebugReportCallbackCreateInfoEXT::builder()
        .flags(report_flags())
        .pfn_callback(Some(debug_report_callback))
        .user_data(Arc::as_ptr(monitor) as *mut c_void)
        .build()
}

/// Create info for a debug-utils messenger bound to `monitor`.
pub fn utils_create_info(monitor: &Arc<Monitor>) -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_utils_callback))
        .user_data(Arc::as_ptr(monitor) as *mut c_void)
        .build()
}

/// The registered callback object, destroyed before the instance.
pub enum DebugSink {
    Report {
        loader: DebugReport,
        callback: vk::DebugReportCallbackEXT,
    },
    Utils {
        loader: DebugUtils,
        messenger: vk::DebugUtilsMessengerEXT,
    },
}

impl DebugSink {
    /// Registers the callback of `kind` on `instance`.
    ///
    /// # Safety
    /// `instance` must have been created with the matching extension enabled,
    /// and `monitor` must outlive the returned sink.
    pub unsafe fn install(
        entry: &ash::Entry,
        instance: &ash::Instance,
        kind: CallbackKind,
        monitor: &Arc<Monitor>,
    ) -> Result<Self> {
        match kind {
            CallbackKind::DebugReport => {
                let loader = DebugReport::new(entry, instance);
                let callback = loader
                    .create_debug_report_callback(&report_create_info(monitor), None)
                    .vk_context("vkCreateDebugReportCallbackEXT")?;
                info!("Debug report callback installed.");
                Ok(DebugSink::Report { loader, callback })
            }
            CallbackKind::DebugUtils => {
                let loader = DebugUtils::new(entry, instance);
                let messenger = loader
                    .create_debug_utils_messenger(&utils_create_info(monitor), None)
                    .vk_context("vkCreateDebugUtilsMessengerEXT")?;
                info!("Debug utils messenger installed.");
                Ok(DebugSink::Utils { loader, messenger })
            }
        }
    }

    /// # Safety
    /// Must be called once, before the owning instance is destroyed.
    pub unsafe fn destroy(&self) {
        match self {
            DebugSink::Report { loader, callback } => {
                loader.destroy_debug_report_callback(*callback, None);
            }
            DebugSink::Utils { loader, messenger } => {
                loader.destroy_debug_utils_messenger(*messenger, None);
            }
        }
        debug!("Debug sink destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::ptr;

    #[test]
    fn report_callback_routes_to_user_data_monitor() {
        let monitor = Arc::new(Monitor::default());
        monitor.set_desired_failure(
            vk::DebugReportFlagsEXT::ERROR,
            "VUID-vkCmdClearAttachments-aspectMask-02501",
        );
        let prefix = CString::new("Validation").unwrap();
        let message =
            CString::new("Validation Error: [ VUID-vkCmdClearAttachments-aspectMask-02501 ] index 2000000000").unwrap();

        let abort = unsafe {
            debug_report_callback(
                vk::DebugReportFlagsEXT::ERROR,
                vk::DebugReportObjectTypeEXT::COMMAND_BUFFER,
                0x42,
                0,
                0,
                prefix.as_ptr(),
                message.as_ptr(),
                Arc::as_ptr(&monitor) as *mut c_void,
            )
        };
        assert_eq!(abort, vk::TRUE);
        let trace = monitor.trace();
        assert_eq!(trace[0].message_id, "VUID-vkCmdClearAttachments-aspectMask-02501");
        assert!(monitor.verify_found());
    }

    #[test]
    fn utils_callback_prefers_structured_id() {
        let monitor = Arc::new(Monitor::default());
        monitor.set_desired_failure(vk::DebugReportFlagsEXT::ERROR, "UNASSIGNED-Custom-id");
        let id = CString::new("UNASSIGNED-Custom-id").unwrap();
        let message = CString::new("body without the id").unwrap();
        let data = vk::DebugUtilsMessengerCallbackDataEXT {
            p_message_id_name: id.as_ptr(),
            p_message: message.as_ptr(),
            ..Default::default()
        };
        let abort = unsafe {
            debug_utils_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                &data,
                Arc::as_ptr(&monitor) as *mut c_void,
            )
        };
        assert_eq!(abort, vk::TRUE);
        assert!(monitor.verify_found());
    }

    #[test]
    fn null_callback_data_is_ignored() {
        let abort = unsafe {
            debug_utils_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        assert_eq!(abort, vk::FALSE);
    }

    #[test]
    fn create_infos_carry_monitor_pointer() {
        let monitor = Arc::new(Monitor::default());
        let report = report_create_info(&monitor);
        assert_eq!(report.p_user_data as *const Monitor, Arc::as_ptr(&monitor));
        assert!(report.pfn_callback.is_some());
        assert_eq!(report.flags, report_flags());
        let utils = utils_create_info(&monitor);
        assert_eq!(utils.p_user_data as *const Monitor, Arc::as_ptr(&monitor));
    }
}
