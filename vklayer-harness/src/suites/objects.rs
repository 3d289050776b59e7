//! Object lifetime, synchronization objects, buffers and shader modules.

use ash::vk;
use std::sync::Arc;
use tracing::debug;

use crate::device::{DeviceContext, DeviceOptions, FeatureRequest};
use crate::error::{check, Result, VkResultExt};
use crate::shader::{builtin, SPIRV_MAGIC};
use crate::testcase::{TestCase, TestContext};

const SPIRV_VERSION_1_0: u32 = 0x0001_0000;

fn submit_signaled_fence(t: &mut TestContext) -> Result<()> {
    let fence = t.make_fence(true)?;
    t.command_buffer_mut().begin()?;
    t.command_buffer_mut().end()?;

    t.expect_error("submitted in SIGNALED state.  Fences must be reset before being submitted");
    let cb = t.command_buffer().handle();
    let result = t.graphics_queue().submit_raw(&[cb], fence.handle());
    debug!(?result, "Submitted with a signaled fence");
    t.graphics_queue().wait_idle()?;
    t.verify_found();
    Ok(())
}

fn invalid_cmd_buffer_event_destroyed(t: &mut TestContext) -> Result<()> {
    let event = t.make_event()?;
    t.command_buffer_mut().begin()?;
    t.command_buffer()
        .set_event(event.handle(), vk::PipelineStageFlags::TOP_OF_PIPE);
    t.command_buffer_mut().end()?;

    t.expect_error("UNASSIGNED-CoreValidation-DrawState-InvalidCommandBuffer-VkEvent");
    drop(event);
    t.command_buffer_mut().invalidate();
    let cb = t.command_buffer().handle();
    let result = t.graphics_queue().submit_raw(&[cb], vk::Fence::null());
    debug!(?result, "Submitted after destroying a recorded event");
    t.verify_found();
    Ok(())
}

fn reset_event_then_set(t: &mut TestContext) -> Result<()> {
    let event = t.make_event()?;
    t.command_buffer_mut()
        .begin_with(vk::CommandBufferUsageFlags::empty(), None)?;
    t.command_buffer()
        .reset_event(event.handle(), vk::PipelineStageFlags::ALL_COMMANDS);
    t.command_buffer_mut().end()?;

    let cb = t.command_buffer().handle();
    check("vkQueueSubmit", t.graphics_queue().submit_raw(&[cb], vk::Fence::null()))?;

    t.expect_error("that is already in use by a command buffer.");
    let result = unsafe { t.device().set_event(event.handle()) };
    debug!(?result, "vkSetEvent while a reset is pending");
    t.verify_found();
    t.graphics_queue().wait_idle()?;
    Ok(())
}

/// Creates a concurrent buffer shared by `families`; a buffer the driver
/// creates anyway is destroyed right away.
fn probe_concurrent_buffer(t: &TestContext, families: &[u32]) {
    let info = vk::BufferCreateInfo::builder()
        .size(1024)
        .usage(vk::BufferUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::CONCURRENT)
        .queue_family_indices(families);
    match unsafe { t.device().create_buffer(&info, None) } {
        Ok(buffer) => unsafe { t.device().destroy_buffer(buffer, None) },
        Err(result) => debug!(?result, ?families, "vkCreateBuffer refused"),
    }
}

fn invalid_queue_family_index(t: &mut TestContext) -> Result<()> {
    for families in [[777, 0], [0, 0]] {
        t.expect_error("VUID-VkBufferCreateInfo-sharingMode-01419");
        probe_concurrent_buffer(t, &families);
        t.verify_found();
    }
    Ok(())
}

fn leak_an_object(t: &mut TestContext) -> Result<()> {
    let options = DeviceOptions {
        features: FeatureRequest::none(),
        compiler: Some(Arc::clone(t.compiler())),
        ..DeviceOptions::default()
    };
    let extra = DeviceContext::new(Arc::clone(t.instance()), t.physical().clone(), &options)?;

    // Created behind the ledger's back so only the layer notices the leak.
    let info = vk::FenceCreateInfo::default();
    let leaked = unsafe { extra.device().create_fence(&info, None) }.vk_context("vkCreateFence")?;
    debug!(?leaked, "Leaking a fence");

    t.expect_error("VUID-vkDestroyDevice-device-00378");
    let report = extra.teardown();
    debug!(clean = report.is_clean(), "Extra device torn down");
    t.verify_found();
    Ok(())
}

/// Calls `vkCreateShaderModule` with `code_size` bytes of `words`, which
/// may be deliberately malformed.
fn probe_shader_module(t: &TestContext, words: &[u32], code_size: usize) {
    let info = vk::ShaderModuleCreateInfo {
        code_size: code_size.min(std::mem::size_of_val(words)),
        p_code: words.as_ptr(),
        ..Default::default()
    };
    match unsafe { t.device().create_shader_module(&info, None) } {
        Ok(module) => unsafe { t.device().destroy_shader_module(module, None) },
        Err(result) => debug!(?result, code_size, "vkCreateShaderModule refused"),
    }
}

fn invalid_spirv_code_size(t: &mut TestContext) -> Result<()> {
    let header = [SPIRV_MAGIC, SPIRV_VERSION_1_0, 0];
    t.expect_error("Invalid SPIR-V header");
    probe_shader_module(t, &header, 4);
    t.verify_found();

    t.expect_error("VUID-VkShaderModuleCreateInfo-pCode-01376");
    probe_shader_module(t, builtin::VERTEX_SPIRV, std::mem::size_of_val(builtin::VERTEX_SPIRV) - 1);
    t.verify_found();
    Ok(())
}

fn invalid_spirv_magic(t: &mut TestContext) -> Result<()> {
    // Header plus four words of body.
    let mut code = [0u32; 7];
    code[0] = !SPIRV_MAGIC;
    code[1] = SPIRV_VERSION_1_0;
    t.expect_error("Invalid SPIR-V magic number");
    probe_shader_module(t, &code, std::mem::size_of_val(&code));
    t.verify_found();
    Ok(())
}

/// Never runs; the device extension does not exist.
fn unsupported_device_extension(_: &mut TestContext) -> Result<()> {
    Ok(())
}

pub fn tests() -> Vec<TestCase> {
    vec![
        TestCase::new("SubmitSignaledFence", submit_signaled_fence).render_target(None),
        TestCase::new("InvalidCmdBufferEventDestroyed", invalid_cmd_buffer_event_destroyed).render_target(None),
        TestCase::new("ResetEventThenSet", reset_event_then_set).render_target(None),
        TestCase::new("InvalidQueueFamilyIndex", invalid_queue_family_index).render_target(None),
        TestCase::new("LeakAnObject", leak_an_object).render_target(None),
        TestCase::new("InvalidSPIRVCodeSize", invalid_spirv_code_size).render_target(None),
        TestCase::new("InvalidSPIRVMagic", invalid_spirv_magic).render_target(None),
        TestCase::new("UnsupportedDeviceExtension", unsupported_device_extension)
            .device_extension("VK_EXT_fake_missing")
            .render_target(None),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::validate_spirv_header;
    use pretty_assertions::assert_eq;

    #[test]
    fn malformed_headers_are_malformed() {
        assert!(validate_spirv_header(&[SPIRV_MAGIC]).is_err());
        let mut code = [0u32; 7];
        code[0] = !SPIRV_MAGIC;
        assert!(validate_spirv_header(&code).is_err());
        assert!(validate_spirv_header(builtin::VERTEX_SPIRV).is_ok());
    }

    #[test]
    fn fake_extension_is_a_requirement() {
        let case = tests()
            .into_iter()
            .find(|t| t.name() == "UnsupportedDeviceExtension")
            .expect("registered");
        assert_eq!(case.requirements().device_extensions, vec!["VK_EXT_fake_missing".to_string()]);
    }
}
