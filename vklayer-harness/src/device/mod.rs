//! Instance, physical device and logical device bring-up.

pub mod context;
pub mod features;
pub mod instance;
pub mod ledger;
pub mod physical;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{info, warn};

pub use context::{DeviceContext, DeviceOptions, Queue, RenderTargetSpec, TeardownReport};
pub use features::FeatureRequest;
pub use instance::HarnessInstance;
pub use ledger::{HandleLedger, LedgerEntry, LedgerViolation};
pub use physical::PhysicalDeviceInfo;

/// A logical device plus the ledger of handles created on it.
///
/// Every harness object holds an `Arc<HarnessDevice>`, so the device is
/// destroyed only after the last object that uses it.
pub struct HarnessDevice {
    raw: ash::Device,
    instance: Arc<HarnessInstance>,
    physical: PhysicalDeviceInfo,
    enabled_features: vk::PhysicalDeviceFeatures,
    enabled_extensions: Vec<String>,
    ledger: Mutex<HandleLedger>,
}

impl HarnessDevice {
    pub(crate) fn new(
        raw: ash::Device,
        instance: Arc<HarnessInstance>,
        physical: PhysicalDeviceInfo,
        enabled_features: vk::PhysicalDeviceFeatures,
        enabled_extensions: Vec<String>,
    ) -> Self {
        Self {
            raw,
            instance,
            physical,
            enabled_features,
            enabled_extensions,
            ledger: Mutex::new(HandleLedger::new()),
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn instance(&self) -> &Arc<HarnessInstance> {
        &self.instance
    }

    pub fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    pub fn enabled_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.enabled_features
    }

    pub fn extension_enabled(&self, name: &str) -> bool {
        self.enabled_extensions.iter().any(|e| e == name)
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.enabled_extensions
    }

    /// Records a freshly created handle in the ledger.
    pub fn track<H: Handle>(&self, handle: H, label: &'static str) {
        self.ledger.lock().record_create(handle, label);
    }

    /// Records the destruction of a handle.
    pub fn untrack<H: Handle>(&self, handle: H) {
        self.ledger.lock().record_destroy(handle);
    }

    pub fn outstanding_handles(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().outstanding()
    }

    pub fn ledger_violations(&self) -> Vec<LedgerViolation> {
        self.ledger.lock().violations().to_vec()
    }

    pub fn wait_idle(&self) -> crate::error::Result<()> {
        use crate::error::VkResultExt;
        unsafe { self.raw.device_wait_idle() }.vk_context("vkDeviceWaitIdle")
    }
}

impl Deref for HarnessDevice {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.raw
    }
}

impl std::fmt::Debug for HarnessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessDevice")
            .field("handle", &self.raw.handle().as_raw())
            .field("physical", &self.physical.name)
            .field("enabled_extensions", &self.enabled_extensions)
            .finish()
    }
}

impl Drop for HarnessDevice {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.raw.device_wait_idle() } {
            warn!("vkDeviceWaitIdle failed before device destruction: {:?}", e);
        }
        let leaked = self.ledger.get_mut().outstanding();
        if !leaked.is_empty() {
            warn!("Destroying device with {} live handle(s)", leaked.len());
        }
        unsafe { self.raw.destroy_device(None) };
        info!("Vulkan logical device destroyed.");
    }
}
