//! The registered validation tests, grouped by the area of the API they
//! exercise.

use ash::vk;

use crate::registry::Registry;
use crate::testcase::TestCase;

pub mod command;
pub mod objects;
pub mod pipeline;
pub mod ray_tracing;

/// Every test, in registration order.
pub fn all() -> Vec<TestCase> {
    let mut tests = command::tests();
    tests.extend(pipeline::tests());
    tests.extend(objects::tests());
    tests.extend(ray_tracing::tests());
    tests
}

pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.extend(all());
    registry
}

/// A clear rect over the whole of `extent`, starting at layer 0.
pub(crate) fn full_clear_rect(extent: vk::Extent2D, layer_count: u32) -> vk::ClearRect {
    vk::ClearRect {
        rect: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        },
        base_array_layer: 0,
        layer_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TestFilter;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique_ignoring_case() {
        let tests = all();
        let registry = registry();
        assert_eq!(registry.len(), tests.len());
        assert!(registry.case_collisions().is_empty());
    }

    #[test]
    fn names_are_filter_friendly() {
        for name in registry().names() {
            assert!(
                name.chars().all(|c| c.is_ascii_alphanumeric()),
                "{name} would need escaping in a filter"
            );
        }
    }

    #[test]
    fn ray_tracing_tests_declare_their_extensions() {
        let registry = registry();
        let filter = TestFilter::parse("*RayTracing*");
        let selected: Vec<_> = registry.select(&filter).collect();
        assert!(!selected.is_empty());
        for test in selected {
            let exts: HashSet<&str> = test
                .requirements()
                .device_extensions
                .iter()
                .map(String::as_str)
                .collect();
            assert!(exts.contains("VK_NV_ray_tracing"), "{}", test.name());
        }
    }

    #[test]
    fn depth_tests_get_a_depth_target() {
        let registry = registry();
        for name in [
            "DynamicDepthBoundsNotBound",
            "DynamicStencilReadNotBound",
            "DynamicStencilWriteNotBound",
            "DynamicStencilRefNotBound",
        ] {
            let test = registry.get(name).expect("registered");
            assert_eq!(test.requirements().render_target.map(|spec| spec.depth), Some(true), "{name}");
        }
    }

    #[test]
    fn clear_rect_spans_the_extent() {
        let extent = vk::Extent2D {
            width: 32,
            height: 16,
        };
        let rect = full_clear_rect(extent, 0);
        assert_eq!(rect.rect.extent, extent);
        assert_eq!((rect.base_array_layer, rect.layer_count), (0, 0));
    }
}
