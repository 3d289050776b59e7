//! Name-based access to `VkPhysicalDeviceFeatures`.
//!
//! Feature names are matched after lowercasing and dropping underscores, so
//! `depthBounds`, `depth_bounds` and `DEPTH_BOUNDS` all name the same field.

use ash::vk;

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

macro_rules! device_features {
    ($($field:ident),* $(,)?) => {
        /// Every core 1.0 feature, in declaration order.
        pub const FEATURE_NAMES: &[&str] = &[$(stringify!($field)),*];

        /// Reads a feature by name; `None` for an unknown name.
        pub fn feature_flag(features: &vk::PhysicalDeviceFeatures, name: &str) -> Option<bool> {
            let key = normalize(name);
            $(
                if key == normalize(stringify!($field)) {
                    return Some(features.$field == vk::TRUE);
                }
            )*
            None
        }

        /// Writes a feature by name; returns `false` for an unknown name.
        pub fn set_feature(features: &mut vk::PhysicalDeviceFeatures, name: &str, enabled: bool) -> bool {
            let key = normalize(name);
            let value = if enabled { vk::TRUE } else { vk::FALSE };
            $(
                if key == normalize(stringify!($field)) {
                    features.$field = value;
                    return true;
                }
            )*
            false
        }

        /// Field-wise AND of two feature sets.
        pub fn intersect(
            a: &vk::PhysicalDeviceFeatures,
            b: &vk::PhysicalDeviceFeatures,
        ) -> vk::PhysicalDeviceFeatures {
            vk::PhysicalDeviceFeatures {
                $($field: if a.$field == vk::TRUE && b.$field == vk::TRUE { vk::TRUE } else { vk::FALSE },)*
            }
        }

        pub fn enabled_feature_names(features: &vk::PhysicalDeviceFeatures) -> Vec<&'static str> {
            let mut names = Vec::new();
            $(
                if features.$field == vk::TRUE {
                    names.push(stringify!($field));
                }
            )*
            names
        }
    };
}

device_features!(
    robust_buffer_access,
    full_draw_index_uint32,
    image_cube_array,
    independent_blend,
    geometry_shader,
    tessellation_shader,
    sample_rate_shading,
    dual_src_blend,
    logic_op,
    multi_draw_indirect,
    draw_indirect_first_instance,
    depth_clamp,
    depth_bias_clamp,
    fill_mode_non_solid,
    depth_bounds,
    wide_lines,
    large_points,
    alpha_to_one,
    multi_viewport,
    sampler_anisotropy,
    texture_compression_etc2,
    texture_compression_astc_ldr,
    texture_compression_bc,
    occlusion_query_precise,
    pipeline_statistics_query,
    vertex_pipeline_stores_and_atomics,
    fragment_stores_and_atomics,
    shader_tessellation_and_geometry_point_size,
    shader_image_gather_extended,
    shader_storage_image_extended_formats,
    shader_storage_image_multisample,
    shader_storage_image_read_without_format,
    shader_storage_image_write_without_format,
    shader_uniform_buffer_array_dynamic_indexing,
    shader_sampled_image_array_dynamic_indexing,
    shader_storage_buffer_array_dynamic_indexing,
    shader_storage_image_array_dynamic_indexing,
    shader_clip_distance,
    shader_cull_distance,
    shader_float64,
    shader_int64,
    shader_int16,
    shader_resource_residency,
    shader_resource_min_lod,
    sparse_binding,
    sparse_residency_buffer,
    sparse_residency_image2_d,
    sparse_residency_image3_d,
    sparse_residency2_samples,
    sparse_residency4_samples,
    sparse_residency8_samples,
    sparse_residency16_samples,
    sparse_residency_aliased,
    variable_multisample_rate,
    inherited_queries,
);

/// Which features a test wants enabled on its device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FeatureRequest {
    /// Enable everything the physical device supports.
    #[default]
    AllSupported,
    /// Enable exactly these features; an unsupported one is a missing
    /// prerequisite. An empty list enables nothing.
    Named(Vec<String>),
}

impl FeatureRequest {
    pub fn none() -> Self {
        FeatureRequest::Named(Vec::new())
    }

    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FeatureRequest::Named(names.into_iter().map(Into::into).collect())
    }

    /// Resolves the request against what the device supports.
    ///
    /// Returns the names that are unknown or unsupported on failure.
    pub fn resolve(
        &self,
        supported: &vk::PhysicalDeviceFeatures,
    ) -> Result<vk::PhysicalDeviceFeatures, Vec<String>> {
        match self {
            FeatureRequest::AllSupported => Ok(*supported),
            FeatureRequest::Named(names) => {
                let mut enabled = vk::PhysicalDeviceFeatures::default();
                let mut missing = Vec::new();
                for name in names {
                    match feature_flag(supported, name) {
                        Some(true) => {
                            set_feature(&mut enabled, name, true);
                        }
                        _ => missing.push(name.clone()),
                    }
                }
                if missing.is_empty() {
                    Ok(enabled)
                } else {
                    Err(missing)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn covers_every_core_feature() {
        assert_eq!(FEATURE_NAMES.len(), 55);
    }

    #[rstest]
    #[case("depthBounds")]
    #[case("depth_bounds")]
    #[case("DEPTH_BOUNDS")]
    fn names_are_normalized(#[case] name: &str) {
        let mut features = vk::PhysicalDeviceFeatures::default();
        assert!(set_feature(&mut features, name, true));
        assert_eq!(features.depth_bounds, vk::TRUE);
        assert_eq!(feature_flag(&features, name), Some(true));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut features = vk::PhysicalDeviceFeatures::default();
        assert!(!set_feature(&mut features, "warpDrive", true));
        assert_eq!(feature_flag(&features, "warpDrive"), None);
    }

    #[test]
    fn named_request_reports_unsupported() {
        let supported = vk::PhysicalDeviceFeatures {
            logic_op: vk::TRUE,
            ..Default::default()
        };
        let enabled = FeatureRequest::named(["logicOp"]).resolve(&supported).unwrap();
        assert_eq!(enabled_feature_names(&enabled), vec!["logic_op"]);

        let missing = FeatureRequest::named(["logicOp", "wideLines"])
            .resolve(&supported)
            .unwrap_err();
        assert_eq!(missing, vec!["wideLines".to_string()]);
    }

    #[test]
    fn empty_request_enables_nothing() {
        let supported = vk::PhysicalDeviceFeatures {
            fill_mode_non_solid: vk::TRUE,
            ..Default::default()
        };
        let enabled = FeatureRequest::none().resolve(&supported).unwrap();
        assert!(enabled_feature_names(&enabled).is_empty());
        let all = FeatureRequest::AllSupported.resolve(&supported).unwrap();
        assert_eq!(enabled_feature_names(&all), vec!["fill_mode_non_solid"]);
    }

    #[test]
    fn intersection_is_fieldwise() {
        let a = vk::PhysicalDeviceFeatures {
            wide_lines: vk::TRUE,
            depth_bounds: vk::TRUE,
            ..Default::default()
        };
        let b = vk::PhysicalDeviceFeatures {
            depth_bounds: vk::TRUE,
            ..Default::default()
        };
        assert_eq!(enabled_feature_names(&intersect(&a, &b)), vec!["depth_bounds"]);
    }
}
