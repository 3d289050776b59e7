use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::HarnessDevice;
use crate::error::{HarnessError, Result, VkResultExt};

super::device_object!(
    DescriptorSetLayout,
    vk::DescriptorSetLayout,
    destroy_descriptor_set_layout,
    "descriptor set layout"
);

super::device_object!(
    /// A descriptor pool; sets allocated from it are freed with it.
    DescriptorPool,
    vk::DescriptorPool,
    destroy_descriptor_pool,
    "descriptor pool"
);

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<HarnessDevice>,
        bindings: &[vk::DescriptorSetLayoutBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<Self> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(flags)
            .bindings(bindings);
        let raw = unsafe { device.create_descriptor_set_layout(&info, None) }
            .vk_context("vkCreateDescriptorSetLayout")?;
        Ok(Self::from_raw(device, raw))
    }
}

/// One pool size per descriptor type, summing the binding counts. Sizes
/// come out ordered by the raw descriptor type value.
pub fn pool_sizes_for(bindings: &[vk::DescriptorSetLayoutBinding]) -> Vec<vk::DescriptorPoolSize> {
    let mut counts: BTreeMap<i32, u32> = BTreeMap::new();
    for binding in bindings {
        *counts.entry(binding.descriptor_type.as_raw()).or_default() += binding.descriptor_count.max(1);
    }
    counts
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

impl DescriptorPool {
    pub fn new(
        device: &Arc<HarnessDevice>,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<Self> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        let raw = unsafe { device.create_descriptor_pool(&info, None) }
            .vk_context("vkCreateDescriptorPool")?;
        Ok(Self::from_raw(device, raw))
    }

    pub fn allocate(&self, layouts: &[vk::DescriptorSetLayout]) -> Result<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.raw)
            .set_layouts(layouts);
        unsafe { self.device.allocate_descriptor_sets(&info) }.vk_context("vkAllocateDescriptorSets")
    }
}

/// The one set an allocation of a single layout must yield.
fn single_set(sets: Vec<vk::DescriptorSet>) -> Result<vk::DescriptorSet> {
    sets.into_iter()
        .next()
        .filter(|set| *set != vk::DescriptorSet::null())
        .ok_or_else(|| HarnessError::Fatal("vkAllocateDescriptorSets returned no descriptor set".to_string()))
}

#[derive(Debug, Clone, Copy)]
enum PendingInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    binding: u32,
    array_element: u32,
    ty: vk::DescriptorType,
    info: PendingInfo,
}

/// A layout, a pool sized for it and the single set allocated from the pool.
#[derive(Debug)]
pub struct OneOffDescriptorSet {
    layout: DescriptorSetLayout,
    pool: DescriptorPool,
    set: vk::DescriptorSet,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
    pending: Vec<PendingWrite>,
}

impl OneOffDescriptorSet {
    pub fn new(device: &Arc<HarnessDevice>, bindings: &[vk::DescriptorSetLayoutBinding]) -> Result<Self> {
        Self::with_layout_flags(device, bindings, vk::DescriptorSetLayoutCreateFlags::empty())
    }

    pub fn with_layout_flags(
        device: &Arc<HarnessDevice>,
        bindings: &[vk::DescriptorSetLayoutBinding],
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<Self> {
        let layout = DescriptorSetLayout::new(device, bindings, flags)?;
        let mut sizes = pool_sizes_for(bindings);
        if sizes.is_empty() {
            // A pool needs at least one size entry.
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            });
        }
        let pool = DescriptorPool::new(device, 1, &sizes, vk::DescriptorPoolCreateFlags::empty())?;
        let set = single_set(pool.allocate(&[layout.handle()])?)?;
        Ok(Self {
            layout,
            pool,
            set,
            bindings: bindings.to_vec(),
            pending: Vec::new(),
        })
    }

    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    pub fn write_descriptor_buffer_info(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
        ty: vk::DescriptorType,
        array_element: u32,
    ) {
        self.pending.push(PendingWrite {
            binding,
            array_element,
            ty,
            info: PendingInfo::Buffer(vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range,
            }),
        });
    }

    pub fn write_descriptor_image_info(
        &mut self,
        binding: u32,
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        ty: vk::DescriptorType,
        layout: vk::ImageLayout,
    ) {
        self.pending.push(PendingWrite {
            binding,
            array_element: 0,
            ty,
            info: PendingInfo::Image(vk::DescriptorImageInfo {
                sampler,
                image_view,
                image_layout: layout,
            }),
        });
    }

    /// Flushes queued writes with one `vkUpdateDescriptorSets` call.
    pub fn update_descriptor_sets(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = pending
            .iter()
            .map(|w| match w.info {
                PendingInfo::Buffer(info) => info,
                PendingInfo::Image(_) => vk::DescriptorBufferInfo::default(),
            })
            .collect();
        let image_infos: Vec<vk::DescriptorImageInfo> = pending
            .iter()
            .map(|w| match w.info {
                PendingInfo::Image(info) => info,
                PendingInfo::Buffer(_) => vk::DescriptorImageInfo::default(),
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = pending
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element)
                    .descriptor_type(w.ty);
                match w.info {
                    PendingInfo::Buffer(_) => builder.buffer_info(&buffer_infos[i..=i]).build(),
                    PendingInfo::Image(_) => builder.image_info(&image_infos[i..=i]).build(),
                }
            })
            .collect();
        unsafe { self.layout.device.update_descriptor_sets(&writes, &[]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn binding(index: u32, ty: vk::DescriptorType, count: u32) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding {
            binding: index,
            descriptor_type: ty,
            descriptor_count: count,
            stage_flags: vk::ShaderStageFlags::ALL,
            p_immutable_samplers: std::ptr::null(),
        }
    }

    #[test]
    fn pool_sizes_sum_per_type() {
        let sizes = pool_sizes_for(&[
            binding(0, vk::DescriptorType::UNIFORM_BUFFER, 2),
            binding(1, vk::DescriptorType::STORAGE_IMAGE, 1),
            binding(2, vk::DescriptorType::UNIFORM_BUFFER, 3),
        ]);
        let summary: Vec<(vk::DescriptorType, u32)> =
            sizes.iter().map(|s| (s.ty, s.descriptor_count)).collect();
        assert_eq!(
            summary,
            vec![
                (vk::DescriptorType::STORAGE_IMAGE, 1),
                (vk::DescriptorType::UNIFORM_BUFFER, 5),
            ]
        );
    }

    #[test]
    fn zero_count_bindings_still_reserve_one() {
        let sizes = pool_sizes_for(&[binding(0, vk::DescriptorType::SAMPLER, 0)]);
        assert_eq!(sizes[0].descriptor_count, 1);
    }

    #[test]
    fn allocation_without_a_set_is_an_error() {
        use ash::vk::Handle;
        assert!(matches!(single_set(Vec::new()), Err(HarnessError::Fatal(_))));
        assert!(single_set(vec![vk::DescriptorSet::null()]).is_err());
        let set = vk::DescriptorSet::from_raw(42);
        assert_eq!(single_set(vec![set]).ok(), Some(set));
    }
}
