use std::{collections::HashMap, ffi::CString, sync::Arc};

use anyhow::{anyhow, ensure, Result};
use ash::vk;

use crate::{device::Device, utils::read_shader_from_bytes, Context, DescriptorSetLayout};

/// Resource-binding layout the ray tracing pipeline is compiled against:
/// one descriptor set layout per binding table (scene globals, the
/// per-geometry buffer arrays, the texture array). Must outlive the
/// pipelines built with it.
pub struct PipelineLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::PipelineLayout,
}

impl PipelineLayout {
    pub(crate) fn new(
        device: Arc<Device>,
        descriptor_set_layouts: &[&DescriptorSetLayout],
    ) -> Result<Self> {
        let layouts = descriptor_set_layouts
            .iter()
            .map(|l| l.inner)
            .collect::<Vec<_>>();

        let pipe_layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);
        let inner = unsafe {
            device
                .inner
                .create_pipeline_layout(&pipe_layout_info, None)?
        };

        Ok(Self { device, inner })
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline_layout(self.inner, None) };
    }
}

/// Compiled SPIR-V for one ray tracing stage. Modules are shared between
/// shader groups through `Arc` and may be dropped once the pipeline has
/// been built.
pub struct ShaderModule {
    device: Arc<Device>,
    pub(crate) inner: vk::ShaderModule,
}

impl ShaderModule {
    pub(crate) fn from_bytes(device: Arc<Device>, source: &[u8]) -> Result<Self> {
        let source = read_shader_from_bytes(source)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&source);
        let inner = unsafe { device.inner.create_shader_module(&create_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_shader_module(self.inner, None);
        }
    }
}

impl Context {
    pub fn create_pipeline_layout(
        &self,
        descriptor_set_layouts: &[&DescriptorSetLayout],
    ) -> Result<PipelineLayout> {
        PipelineLayout::new(self.device.clone(), descriptor_set_layouts)
    }

    pub fn create_shader_module(&self, source: &[u8]) -> Result<ShaderModule> {
        ShaderModule::from_bytes(self.device.clone(), source)
    }
}

/// Named association of a shader module, an entry point, a pipeline stage
/// and a shader group type. The name is the key the shader binding table
/// later resolves identifiers by, and must be unique within a pipeline.
struct ShaderGroup {
    name: String,
    module: Arc<ShaderModule>,
    entry_point: String,
    stage: vk::ShaderStageFlags,
    group: vk::RayTracingShaderGroupTypeKHR,
}

/// Accumulates shader groups for one ray tracing pipeline. Exactly one
/// raygen group (`set_raygen` is last-write-wins); miss and hit groups are
/// indexed by insertion order, which is the index ray dispatches use.
pub struct RTPipelineBuilder<'a> {
    raygen: Option<ShaderGroup>,
    miss: Vec<ShaderGroup>,
    hitgroups: Vec<ShaderGroup>,
    layout: Option<&'a PipelineLayout>,
    recursion_depth: u32,
}

impl<'a> RTPipelineBuilder<'a> {
    pub fn new() -> Self {
        Self {
            raygen: None,
            miss: vec![],
            hitgroups: vec![],
            layout: None,
            recursion_depth: 1,
        }
    }

    pub fn set_raygen(
        mut self,
        name: &str,
        module: &Arc<ShaderModule>,
        entry_point: &str,
    ) -> Self {
        self.raygen = Some(ShaderGroup {
            name: name.to_owned(),
            module: module.clone(),
            entry_point: entry_point.to_owned(),
            stage: vk::ShaderStageFlags::RAYGEN_KHR,
            group: vk::RayTracingShaderGroupTypeKHR::GENERAL,
        });
        self
    }

    pub fn add_miss(mut self, name: &str, module: &Arc<ShaderModule>, entry_point: &str) -> Self {
        self.miss.push(ShaderGroup {
            name: name.to_owned(),
            module: module.clone(),
            entry_point: entry_point.to_owned(),
            stage: vk::ShaderStageFlags::MISS_KHR,
            group: vk::RayTracingShaderGroupTypeKHR::GENERAL,
        });
        self
    }

    pub fn add_hitgroup(
        mut self,
        name: &str,
        module: &Arc<ShaderModule>,
        entry_point: &str,
    ) -> Self {
        self.hitgroups.push(ShaderGroup {
            name: name.to_owned(),
            module: module.clone(),
            entry_point: entry_point.to_owned(),
            stage: vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            group: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
        });
        self
    }

    pub fn set_layout(mut self, layout: &'a PipelineLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn set_recursion_depth(mut self, depth: u32) -> Self {
        self.recursion_depth = depth;
        self
    }

    /// Compiles all stages into one pipeline and fetches every group's
    /// fixed-size shader identifier. Missing raygen or layout is a fatal
    /// configuration error, caught before any device call.
    pub fn build(self, context: &Context) -> Result<RTPipeline> {
        let raygen = self
            .raygen
            .ok_or_else(|| anyhow!("ray tracing pipeline has no raygen shader"))?;
        let layout = self
            .layout
            .ok_or_else(|| anyhow!("ray tracing pipeline has no layout"))?;

        let max_depth = context
            .ray_tracing
            .pipeline_properties
            .max_ray_recursion_depth;
        ensure!(
            self.recursion_depth <= max_depth,
            "recursion depth {} exceeds the device limit {}",
            self.recursion_depth,
            max_depth
        );

        let shaders = std::iter::once(raygen)
            .chain(self.miss)
            .chain(self.hitgroups)
            .collect::<Vec<_>>();

        let ident_size = context
            .ray_tracing
            .pipeline_properties
            .shader_group_handle_size as usize;
        let ident_offsets = assign_ident_offsets(
            shaders.iter().map(|sg| sg.name.as_str()),
            ident_size,
        )?;

        let entry_points = shaders
            .iter()
            .map(|sg| CString::new(sg.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stages = Vec::with_capacity(shaders.len());
        let mut groups = Vec::with_capacity(shaders.len());
        for (index, sg) in shaders.iter().enumerate() {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(sg.stage)
                    .module(sg.module.inner)
                    .name(&entry_points[index])
                    .build(),
            );

            let group = vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(sg.group)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR);
            let group = if sg.group == vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP {
                group.closest_hit_shader(index as _)
            } else {
                group.general_shader(index as _)
            };
            groups.push(group.build());
        }

        let pipe_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .layout(layout.inner)
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(self.recursion_depth);

        let inner = unsafe {
            context.ray_tracing.pipeline_fn.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipe_info),
                None,
            )?[0]
        };

        let shader_identifiers = unsafe {
            context
                .ray_tracing
                .pipeline_fn
                .get_ray_tracing_shader_group_handles(
                    inner,
                    0,
                    groups.len() as _,
                    groups.len() * ident_size,
                )?
        };

        Ok(RTPipeline {
            device: context.device.clone(),
            inner,
            ident_size,
            shader_identifiers,
            ident_offsets,
        })
    }
}

impl<'a> Default for RTPipelineBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Group order defines identifier offsets: group i's identifier occupies
/// bytes `[i * ident_size, (i + 1) * ident_size)` of the identifier blob.
fn assign_ident_offsets<'n>(
    names: impl Iterator<Item = &'n str>,
    ident_size: usize,
) -> Result<HashMap<String, usize>> {
    let mut offsets = HashMap::new();
    for (index, name) in names.enumerate() {
        ensure!(
            offsets.insert(name.to_owned(), index * ident_size).is_none(),
            "duplicate shader group name {name:?}"
        );
    }

    Ok(offsets)
}

/// Immutable, fully-built ray tracing pipeline: the pipeline handle plus
/// every group's shader identifier, addressable by group name. Invalidated
/// when the owning device is destroyed.
pub struct RTPipeline {
    device: Arc<Device>,
    pub(crate) inner: vk::Pipeline,
    ident_size: usize,
    shader_identifiers: Vec<u8>,
    ident_offsets: HashMap<String, usize>,
}

impl RTPipeline {
    /// Identifier bytes of the named group; exactly `shader_ident_size()`
    /// bytes. Querying a name that was never registered is a fatal lookup
    /// error.
    pub fn shader_ident(&self, name: &str) -> Result<&[u8]> {
        let offset = *self
            .ident_offsets
            .get(name)
            .ok_or_else(|| anyhow!("shader identifier {name:?} not found"))?;

        Ok(&self.shader_identifiers[offset..offset + self.ident_size])
    }

    pub fn shader_ident_size(&self) -> usize {
        self.ident_size
    }
}

impl Drop for RTPipeline {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline(self.inner, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_offsets_follow_group_order() {
        let offsets =
            assign_ident_offsets(["raygen", "miss", "shadow_miss", "hit"].into_iter(), 32)
                .unwrap();

        assert_eq!(offsets["raygen"], 0);
        assert_eq!(offsets["miss"], 32);
        assert_eq!(offsets["shadow_miss"], 64);
        assert_eq!(offsets["hit"], 96);
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let result = assign_ident_offsets(["raygen", "miss", "miss"].into_iter(), 32);
        assert!(result.is_err());
    }
}
