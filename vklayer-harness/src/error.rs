//! Error types for the harness.
//!
//! [`HarnessError`] is the single error type returned by fallible harness
//! operations. Its variants line up with the outcome categories a test can
//! end in: a missing prerequisite becomes a skip, a [`HarnessError::Vulkan`]
//! status is a driver hard error, and [`HarnessError::Fatal`] aborts the
//! current test and taints the run.

use ash::{prelude::VkResult, vk};
use std::panic::Location;
use std::path::PathBuf;
use thiserror::Error;

use crate::objects::command::CommandBufferState;

/// Result alias used throughout the crate.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The Vulkan loader library could not be found or opened.
    #[error("Failed to load the Vulkan loader: {0}")]
    Loading(#[from] ash::LoadingError),

    /// A Vulkan entry point returned a status the caller did not opt into.
    #[error("{call} returned {result:?} (at {location})")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
        location: &'static Location<'static>,
    },

    /// Instance or device bring-up failed, or the device was lost.
    #[error("Fatal harness failure: {0}")]
    Fatal(String),

    /// A required extension, feature, layer, API version or tool is absent.
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("No physical device exposes a queue family with {0:?}")]
    NoSuitableDevice(vk::QueueFlags),

    #[error("No memory type satisfies type bits {type_bits:#x} with {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// The harness refused a command buffer transition that is illegal in the
    /// current state. Tests that probe illegal transitions call the raw entry
    /// point instead.
    #[error("Cannot {operation} a command buffer in the {state:?} state")]
    IllegalCommandBufferState {
        state: CommandBufferState,
        operation: &'static str,
    },

    /// A render target layout the harness cannot build.
    #[error("Invalid render target: {0}")]
    InvalidRenderTarget(String),

    #[error(transparent)]
    Shader(#[from] ShaderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("String contains an interior NUL byte: {0}")]
    Nul(#[from] std::ffi::NulError),
}

impl HarnessError {
    /// Builds a [`HarnessError::Vulkan`] that records the caller's location.
    #[track_caller]
    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        HarnessError::Vulkan {
            call,
            result,
            location: Location::caller(),
        }
    }

    /// True for failures after which the current test cannot continue.
    pub fn is_fatal(&self) -> bool {
        match self {
            HarnessError::Fatal(_) | HarnessError::Loading(_) => true,
            HarnessError::Vulkan { result, .. } => *result == vk::Result::ERROR_DEVICE_LOST,
            _ => false,
        }
    }

    /// True when the error means "this environment cannot run the test".
    pub fn is_missing_prerequisite(&self) -> bool {
        matches!(
            self,
            HarnessError::MissingPrerequisite(_)
                | HarnessError::Shader(ShaderError::CompilerUnavailable { .. })
        )
    }

    /// Source location attached to the error, if any.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            HarnessError::Vulkan { location, .. } => Some(location),
            _ => None,
        }
    }
}

/// Extension for `VkResult` that names the failing entry point.
pub trait VkResultExt<T> {
    fn vk_context(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    #[track_caller]
    fn vk_context(self, call: &'static str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(result) => Err(HarnessError::vulkan(call, result)),
        }
    }
}

/// Converts a raw status returned through a function-pointer table.
#[track_caller]
pub fn check(call: &'static str, result: vk::Result) -> Result<()> {
    if result == vk::Result::SUCCESS {
        Ok(())
    } else {
        Err(HarnessError::vulkan(call, result))
    }
}

/// Errors raised while turning shader sources into SPIR-V.
#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("No {language} compiler available: {reason}")]
    CompilerUnavailable {
        language: &'static str,
        reason: String,
    },

    #[error("Failed to compile {stage:?} shader:\n{log}")]
    CompileFailed {
        stage: vk::ShaderStageFlags,
        log: String,
    },

    #[error("Failed to assemble SPIR-V:\n{0}")]
    AssembleFailed(String),

    #[error("SPIR-V blob is malformed: {0}")]
    InvalidSpirv(String),
}

/// Errors raised while loading [`crate::config::HarnessConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An error occurred while attempting to read a configuration file.
    #[error("Failed to read configuration file from {path:?}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Parsing succeeded but a value is out of range.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_context_records_call_and_location() {
        let failing: VkResult<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = failing.vk_context("vkAllocateMemory").unwrap_err();
        match &err {
            HarnessError::Vulkan { call, result, location } => {
                assert_eq!(*call, "vkAllocateMemory");
                assert_eq!(*result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                assert!(location.file().ends_with("error.rs"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!err.is_fatal());
    }

    #[test]
    fn device_lost_is_fatal() {
        assert!(HarnessError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(HarnessError::Fatal("instance".into()).is_fatal());
    }

    #[test]
    fn missing_compiler_counts_as_prerequisite() {
        let err = HarnessError::from(ShaderError::CompilerUnavailable {
            language: "GLSL",
            reason: "not installed".into(),
        });
        assert!(err.is_missing_prerequisite());
        assert!(HarnessError::MissingPrerequisite("VK_EXT_fake_missing".into()).is_missing_prerequisite());
    }

    #[test]
    fn check_maps_success_to_ok() {
        assert!(check("vkCreateFence", vk::Result::SUCCESS).is_ok());
        assert!(check("vkCreateFence", vk::Result::ERROR_VALIDATION_FAILED_EXT).is_err());
    }
}
