//! Offscreen Vulkan ray tracing backend: turns a [`scene::Scene`] into
//! rendered frames. Owns the acceleration structures, the ray tracing
//! pipeline, the shader binding table and the per-frame command recording;
//! scene loading and display belong to the caller.

use std::mem::size_of;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use glam::{Mat4, Vec3};

use scene::Scene;
use vkrt::ash::vk;
use vkrt::gpu_allocator::MemoryLocation;
use vkrt::utils::create_gpu_only_buffer_from_data_batch;
use vkrt::{
    Buffer, CommandBuffer, CommandPool, Context, ContextBuilder, DescriptorPool, DescriptorSet,
    DescriptorSetLayout, DeviceFeatures, Fence, Geometry, Image, ImageBarrier, ImageView,
    MeshInstance, PipelineLayout, RTPipeline, RTPipelineBuilder, SBTBuilder, Sampler,
    ShaderBindingTable, ShaderRecord, TimestampQueryPool, TopLevelBvh, TriangleMesh,
    WriteDescriptorSet, WriteDescriptorSetKind, VERSION_1_3,
};

mod ubo;

pub use ubo::ViewParams;

const DEVICE_EXTENSIONS: [&str; 3] = [
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_acceleration_structure",
    "VK_KHR_deferred_host_operations",
];

/// Buffer-table index meaning "this geometry has no such attribute".
const UNSET_BUFFER: u32 = u32::MAX;

/// SPIR-V binaries for the pipeline's shader groups, injected by the
/// caller. What the shaders compute is out of this crate's hands; the
/// group names they are bound under are fixed.
pub struct ShaderLibrary {
    pub raygen: Vec<u8>,
    pub miss: Vec<u8>,
    pub occlusion_miss: Vec<u8>,
    pub closest_hit: Vec<u8>,
}

/// Per-frame timing reported back from `render`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderStats {
    pub render_time_ms: f32,
    pub rays_per_second: f32,
}

/// Parameter block of one hit group record: indices into the per-geometry
/// buffer tables plus the material id. Written into the shader binding
/// table, one record per geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct HitGroupParams {
    vert_buf: u32,
    idx_buf: u32,
    normal_buf: u32,
    uv_buf: u32,
    col_buf: u32,
    material_id: u32,
}

/// Global buffer tables the hit shaders index into, one array per
/// attribute kind.
#[derive(Default)]
struct GeometryTables {
    vertex: Vec<Arc<Buffer>>,
    index: Vec<Arc<Buffer>>,
    normal: Vec<Arc<Buffer>>,
    uv: Vec<Arc<Buffer>>,
    color: Vec<Arc<Buffer>>,
}

struct SceneGeometry {
    tables: GeometryTables,
    per_mesh: Vec<Vec<Geometry>>,
    hit_params: Vec<HitGroupParams>,
}

struct RenderTarget {
    view: ImageView,
    image: Image,
}

struct Texture {
    view: ImageView,
    _image: Image,
}

struct PipelineResources {
    pipeline: RTPipeline,
    layout: PipelineLayout,
    set_layouts: Vec<DescriptorSetLayout>,
}

struct DescriptorTable {
    sets: Vec<DescriptorSet>,
    _pool: DescriptorPool,
}

pub struct Renderer {
    frame_id: u32,
    width: u32,
    height: u32,
    frame: Vec<u8>,
    cached_view: Option<ViewParams>,
    shaders: ShaderLibrary,

    sbt: Option<ShaderBindingTable>,
    descriptors: Option<DescriptorTable>,
    pipeline_res: Option<PipelineResources>,
    // Owned for their device lifetimes; shaders read them through the
    // descriptor tables and the instance records.
    _textures: Vec<Texture>,
    _sampler: Option<Sampler>,
    _light_buf: Option<Buffer>,
    _material_buf: Option<Buffer>,
    _geometry_tables: GeometryTables,
    scene_bvh: Option<TopLevelBvh>,
    meshes: Vec<TriangleMesh>,
    view_params_buf: Buffer,
    readback_buffer: Option<Buffer>,
    accum_buffer: Option<RenderTarget>,
    render_target: Option<RenderTarget>,
    timestamp_pool: TimestampQueryPool<2>,
    fence: Fence,
    render_cmd: CommandBuffer,
    _render_cmd_pool: CommandPool,
    // Dropped last: every resource above was created through it.
    context: Context,
}

impl Renderer {
    pub fn new(shaders: ShaderLibrary) -> Result<Self> {
        let context = ContextBuilder::new()
            .app_name("rt-backend")
            .vulkan_version(VERSION_1_3)
            .required_extensions(&DEVICE_EXTENSIONS)
            .required_device_features(DeviceFeatures {
                ray_tracing_pipeline: true,
                acceleration_structure: true,
                runtime_descriptor_array: true,
                buffer_device_address: true,
                synchronization2: true,
            })
            .build()?;

        let render_cmd_pool = context.create_command_pool(
            context.graphics_queue_family,
            Some(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
        )?;
        let render_cmd = render_cmd_pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
        let fence = context.create_fence(None)?;
        let timestamp_pool = context.create_timestamp_query_pool::<2>()?;

        let view_params_buf = context.create_buffer(
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            size_of::<ViewParams>() as _,
        )?;

        Ok(Self {
            frame_id: 0,
            width: 0,
            height: 0,
            frame: vec![],
            cached_view: None,
            shaders,
            sbt: None,
            descriptors: None,
            pipeline_res: None,
            _textures: vec![],
            _sampler: None,
            _light_buf: None,
            _material_buf: None,
            _geometry_tables: GeometryTables::default(),
            scene_bvh: None,
            meshes: vec![],
            view_params_buf,
            readback_buffer: None,
            accum_buffer: None,
            render_target: None,
            timestamp_pool,
            fence,
            render_cmd,
            _render_cmd_pool: render_cmd_pool,
            context,
        })
    }

    /// Allocates the render target and accumulation images for the given
    /// framebuffer size. Idempotent when the size is unchanged; otherwise
    /// prior images are torn down and recreated.
    pub fn initialize(&mut self, width: u32, height: u32) -> Result<()> {
        if self.width == width && self.height == height && self.render_target.is_some() {
            return Ok(());
        }

        self.render_target = None;
        self.accum_buffer = None;
        self.readback_buffer = None;

        self.width = width;
        self.height = height;
        self.frame_id = 0;
        self.cached_view = None;

        let render_image = self.context.create_image(
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::Format::R8G8B8A8_UNORM,
            width,
            height,
        )?;
        let accum_image = self.context.create_image(
            vk::ImageUsageFlags::STORAGE,
            vk::Format::R32G32B32A32_SFLOAT,
            width,
            height,
        )?;

        self.context.execute_one_time_commands(|cmd_buffer| {
            let to_general = |image| ImageBarrier {
                image,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::GENERAL,
                src_access_mask: vk::AccessFlags2::empty(),
                dst_access_mask: vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
                src_stage_mask: vk::PipelineStageFlags2::NONE,
                dst_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            };
            cmd_buffer.pipeline_image_barriers(&[to_general(&render_image), to_general(&accum_image)]);
        })?;

        let readback_buffer = self.context.create_buffer(
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            render_image.linear_size(),
        )?;
        self.frame = vec![0; render_image.linear_size() as usize];

        self.render_target = Some(RenderTarget {
            view: render_image.create_image_view()?,
            image: render_image,
        });
        self.accum_buffer = Some(RenderTarget {
            view: accum_image.create_image_view()?,
            image: accum_image,
        });
        self.readback_buffer = Some(readback_buffer);

        // Image bindings changed, so descriptor sets are stale until the
        // next set_scene.
        self.descriptors = None;

        Ok(())
    }

    /// Uploads the scene to the device and builds everything a ray
    /// dispatch needs: one bottom level structure per mesh (compacted), the
    /// top level structure over the instances, material/light tables,
    /// textures, the pipeline, the shader binding table and the descriptor
    /// sets. Must run after `initialize` and before `render`.
    pub fn set_scene(&mut self, scene: &Scene) -> Result<()> {
        ensure!(
            self.render_target.is_some(),
            "initialize must be called before set_scene"
        );
        scene.validate()?;

        log::info!(
            "uploading scene: {} meshes, {} instances, {} unique / {} total triangles",
            scene.meshes.len(),
            scene.instances.len(),
            scene.unique_tris(),
            scene.total_tris()
        );

        let SceneGeometry {
            tables,
            per_mesh,
            hit_params,
        } = upload_geometry(&self.context, scene)?;

        let meshes = build_bottom_level_structures(&self.context, per_mesh)?;
        let scene_bvh = build_top_level_structure(&self.context, scene, &meshes)?;

        // Parameter tables; a zeroed placeholder row keeps the bindings
        // valid when the scene carries no materials or lights.
        let materials = if scene.materials.is_empty() {
            vec![scene::DisneyMaterial::default()]
        } else {
            scene.materials.clone()
        };
        let material_buf = upload_table(&self.context, &materials)?;

        let lights = if scene.lights.is_empty() {
            vec![scene::QuadLight {
                emission: glam::Vec4::ZERO,
                position: glam::Vec4::ZERO,
                normal: glam::Vec4::ZERO,
                v_x: glam::Vec4::ZERO,
                v_y: glam::Vec4::ZERO,
            }]
        } else {
            scene.lights.clone()
        };
        let light_buf = upload_table(&self.context, &lights)?;

        let sampler = self.context.create_texture_sampler()?;
        let textures = upload_textures(&self.context, scene)?;

        let pipeline_res =
            build_raytracing_pipeline(&self.context, &self.shaders, &tables, textures.len())?;
        let sbt =
            build_shader_binding_table(&self.context, &pipeline_res.pipeline, &hit_params)?;

        let descriptors = build_descriptor_table(
            &self.context,
            &pipeline_res,
            &tables,
            &textures,
            &sampler,
            &scene_bvh,
            &self.render_target.as_ref().unwrap().view,
            &self.accum_buffer.as_ref().unwrap().view,
            &self.view_params_buf,
            &material_buf,
            &light_buf,
        )?;

        self.sbt = Some(sbt);
        self.descriptors = Some(descriptors);
        self.pipeline_res = Some(pipeline_res);
        self._textures = textures;
        self._sampler = Some(sampler);
        self._light_buf = Some(light_buf);
        self._material_buf = Some(material_buf);
        self.scene_bvh = Some(scene_bvh);
        self.meshes = meshes;
        self._geometry_tables = tables;
        self.frame_id = 0;

        Ok(())
    }

    /// Renders one frame. The camera basis is recomputed only when
    /// `camera_changed`, which also restarts accumulation. With
    /// `readback_requested` the call blocks until the frame completed and
    /// copies the render target into host memory (see `framebuffer`).
    pub fn render(
        &mut self,
        position: Vec3,
        direction: Vec3,
        up: Vec3,
        vertical_fov: f32,
        camera_changed: bool,
        readback_requested: bool,
    ) -> Result<RenderStats> {
        let render_target = self
            .render_target
            .as_ref()
            .ok_or_else(|| anyhow!("renderer is not initialized"))?;
        let pipeline_res = self
            .pipeline_res
            .as_ref()
            .ok_or_else(|| anyhow!("no scene has been set"))?;
        let descriptors = self.descriptors.as_ref().unwrap();
        let sbt = self.sbt.as_ref().unwrap();

        if camera_changed || self.cached_view.is_none() {
            self.frame_id = 0;
            self.cached_view = Some(ViewParams::new(
                position,
                direction,
                up,
                vertical_fov,
                self.width,
                self.height,
                0,
            ));
        }
        let mut view = self.cached_view.unwrap();
        view.frame_id = self.frame_id;
        self.view_params_buf.copy_data_to_buffer(&[view])?;

        let cmd_buffer = &self.render_cmd;
        cmd_buffer.reset()?;
        cmd_buffer.begin(None)?;

        cmd_buffer.reset_all_timestamp_queries_from_pool(&self.timestamp_pool);
        cmd_buffer.write_timestamp(vk::PipelineStageFlags2::NONE, &self.timestamp_pool, 0);

        cmd_buffer.bind_rt_pipeline(&pipeline_res.pipeline);
        let sets = descriptors.sets.iter().collect::<Vec<_>>();
        cmd_buffer.bind_descriptor_sets(
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            &pipeline_res.layout,
            0,
            &sets,
        );
        cmd_buffer.trace_rays(sbt, self.width, self.height);

        cmd_buffer.write_timestamp(
            vk::PipelineStageFlags2::ALL_COMMANDS,
            &self.timestamp_pool,
            1,
        );

        if readback_requested {
            let readback_buffer = self.readback_buffer.as_ref().unwrap();
            cmd_buffer.pipeline_image_barriers(&[ImageBarrier {
                image: &render_target.image,
                old_layout: vk::ImageLayout::GENERAL,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_access_mask: vk::AccessFlags2::SHADER_WRITE,
                dst_access_mask: vk::AccessFlags2::TRANSFER_READ,
                src_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                dst_stage_mask: vk::PipelineStageFlags2::TRANSFER,
            }]);
            cmd_buffer.copy_image_to_buffer(
                &render_target.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback_buffer,
            );
            cmd_buffer.pipeline_image_barriers(&[ImageBarrier {
                image: &render_target.image,
                old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                new_layout: vk::ImageLayout::GENERAL,
                src_access_mask: vk::AccessFlags2::TRANSFER_READ,
                dst_access_mask: vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
                src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
                dst_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            }]);
        }

        cmd_buffer.end()?;

        self.fence.reset()?;
        self.context.graphics_queue.submit(cmd_buffer, &self.fence)?;
        // The command buffer and query pool are reused next frame, so wait
        // here; this is also where the timing results become available.
        self.fence.wait(None)?;

        let [start, end] = self.timestamp_pool.wait_for_all_results()?;
        let elapsed_ns = end.saturating_sub(start);
        let render_time_ms = elapsed_ns as f32 / 1e6;
        let rays = (self.width * self.height) as f32;
        let rays_per_second = if elapsed_ns > 0 {
            rays / (elapsed_ns as f32 / 1e9)
        } else {
            0.0
        };

        if readback_requested {
            let readback_buffer = self.readback_buffer.as_ref().unwrap();
            let mapping = readback_buffer.map()?;
            let frame_len = self.frame.len();
            unsafe {
                self.frame.copy_from_slice(std::slice::from_raw_parts(
                    mapping,
                    frame_len,
                ));
            }
            readback_buffer.unmap()?;
        }

        self.frame_id += 1;

        Ok(RenderStats {
            render_time_ms,
            rays_per_second,
        })
    }

    /// Host copy of the last frame read back by `render`. RGBA8, row
    /// major, `width * height * 4` bytes.
    pub fn framebuffer(&self) -> &[u8] {
        &self.frame
    }

    pub fn num_instances(&self) -> usize {
        self.scene_bvh.as_ref().map_or(0, TopLevelBvh::num_instances)
    }

    pub fn num_meshes(&self) -> usize {
        self.meshes.len()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.context.device_wait_idle() {
            log::error!("device_wait_idle failed during renderer teardown: {err}");
        }
    }
}

fn push_index(table: &mut Vec<Arc<Buffer>>, buffer: &Arc<Buffer>) -> u32 {
    table.push(buffer.clone());
    (table.len() - 1) as u32
}

/// Optional per-vertex attributes only get a buffer when the geometry
/// carries them.
fn upload_optional<T: Copy>(
    context: &Context,
    usage: vk::BufferUsageFlags,
    data: &[T],
    cmd_buffer: &CommandBuffer,
    stagings: &mut Vec<Buffer>,
) -> Result<Option<Arc<Buffer>>> {
    if data.is_empty() {
        return Ok(None);
    }
    let (buffer, staging) = create_gpu_only_buffer_from_data_batch(context, usage, data, cmd_buffer)?;
    stagings.push(staging);
    Ok(Some(Arc::new(buffer)))
}

/// Uploads every geometry's buffers through one batched submission and
/// assembles the global buffer tables plus the per-geometry hit record
/// parameters.
fn upload_geometry(context: &Context, scene: &Scene) -> Result<SceneGeometry> {
    let build_usage = vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    let attribute_usage = vk::BufferUsageFlags::STORAGE_BUFFER;

    let mut tables = GeometryTables::default();
    let mut per_mesh = Vec::with_capacity(scene.meshes.len());
    let mut hit_params = vec![];
    let mut stagings = vec![];

    let cmd_buffer = context
        .command_pool
        .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
    cmd_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

    for mesh in &scene.meshes {
        let mut geometries = Vec::with_capacity(mesh.geometries.len());
        for geometry in &mesh.geometries {
            let (vertex_buf, staging) =
                create_gpu_only_buffer_from_data_batch(context, build_usage, &geometry.positions, &cmd_buffer)?;
            stagings.push(staging);
            let vertex_buf = Arc::new(vertex_buf);

            let (index_buf, staging) =
                create_gpu_only_buffer_from_data_batch(context, build_usage, &geometry.indices, &cmd_buffer)?;
            stagings.push(staging);
            let index_buf = Arc::new(index_buf);

            let normal_buf =
                upload_optional(context, attribute_usage, &geometry.normals, &cmd_buffer, &mut stagings)?;
            let uv_buf =
                upload_optional(context, attribute_usage, &geometry.uvs, &cmd_buffer, &mut stagings)?;
            let color_buf =
                upload_optional(context, attribute_usage, &geometry.colors, &cmd_buffer, &mut stagings)?;

            hit_params.push(HitGroupParams {
                vert_buf: push_index(&mut tables.vertex, &vertex_buf),
                idx_buf: push_index(&mut tables.index, &index_buf),
                normal_buf: normal_buf
                    .as_ref()
                    .map_or(UNSET_BUFFER, |b| push_index(&mut tables.normal, b)),
                uv_buf: uv_buf
                    .as_ref()
                    .map_or(UNSET_BUFFER, |b| push_index(&mut tables.uv, b)),
                col_buf: color_buf
                    .as_ref()
                    .map_or(UNSET_BUFFER, |b| push_index(&mut tables.color, b)),
                material_id: geometry.material_id,
            });

            geometries.push(Geometry::new(
                vertex_buf, index_buf, normal_buf, uv_buf, color_buf, true,
            ));
        }
        per_mesh.push(geometries);
    }

    cmd_buffer.end()?;
    let fence = context.create_fence(None)?;
    context.graphics_queue.submit(&cmd_buffer, &fence)?;
    fence.wait(None)?;
    context.command_pool.free_command_buffer(&cmd_buffer)?;

    Ok(SceneGeometry {
        tables,
        per_mesh,
        hit_params,
    })
}

/// One bottom level structure per mesh. Builds are submitted together and
/// fence-gated; the compaction pass runs as a second submission gated on
/// the build fence, and `finalize` releases all scratch memory.
fn build_bottom_level_structures(
    context: &Context,
    per_mesh: Vec<Vec<Geometry>>,
) -> Result<Vec<TriangleMesh>> {
    let mut meshes = per_mesh
        .into_iter()
        .map(|geometries| TriangleMesh::new(context, geometries, TriangleMesh::DEFAULT_BUILD_FLAGS))
        .collect::<Result<Vec<_>>>()?;

    let cmd_buffer = context
        .command_pool
        .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
    cmd_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;
    for mesh in &mut meshes {
        mesh.enqueue_build(context, &cmd_buffer)?;
    }
    cmd_buffer.end()?;

    let build_fence = context.create_fence(None)?;
    context.graphics_queue.submit(&cmd_buffer, &build_fence)?;
    build_fence.wait(None)?;
    context.command_pool.free_command_buffer(&cmd_buffer)?;
    for mesh in &mut meshes {
        mesh.mark_built(&build_fence)?;
    }

    let cmd_buffer = context
        .command_pool
        .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
    cmd_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;
    for mesh in &mut meshes {
        mesh.enqueue_compaction(context, &cmd_buffer)?;
    }
    cmd_buffer.end()?;

    let compact_fence = context.create_fence(None)?;
    context.graphics_queue.submit(&cmd_buffer, &compact_fence)?;
    compact_fence.wait(None)?;
    context.command_pool.free_command_buffer(&cmd_buffer)?;
    for mesh in &mut meshes {
        mesh.mark_compacted(&compact_fence)?;
        mesh.finalize()?;
    }

    Ok(meshes)
}

/// Builds the top level structure over the scene instances. Packing the
/// instances requires every referenced mesh to be finalized, which is what
/// gates this build on bottom level completion.
fn build_top_level_structure(
    context: &Context,
    scene: &Scene,
    meshes: &[TriangleMesh],
) -> Result<TopLevelBvh> {
    let geometry_counts = scene
        .meshes
        .iter()
        .map(|m| m.geometries.len())
        .collect::<Vec<_>>();
    let record_offsets = hitgroup_record_offsets(&geometry_counts);

    let instances = scene
        .instances
        .iter()
        .enumerate()
        .map(|(instance_id, instance)| {
            MeshInstance::new(
                &meshes[instance.mesh_id],
                pack_transform(instance.transform),
                instance_id as u32,
                0xFF,
                record_offsets[instance.mesh_id],
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut scene_bvh = TopLevelBvh::new(context, instances)?;

    let cmd_buffer = context
        .command_pool
        .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
    cmd_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;
    scene_bvh.enqueue_build(context, &cmd_buffer)?;
    cmd_buffer.end()?;

    let fence = context.create_fence(None)?;
    context.graphics_queue.submit(&cmd_buffer, &fence)?;
    fence.wait(None)?;
    context.command_pool.free_command_buffer(&cmd_buffer)?;

    scene_bvh.mark_built(&fence)?;
    scene_bvh.finalize()?;

    Ok(scene_bvh)
}

/// Hit records are laid out per unique mesh geometry; an instance's SBT
/// record offset is the geometry count of all meshes before its own.
fn hitgroup_record_offsets(geometry_counts: &[usize]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(geometry_counts.len());
    let mut offset = 0u32;
    for count in geometry_counts {
        offsets.push(offset);
        offset += *count as u32;
    }
    offsets
}

/// Row-major 3x4 matrix expected by the instance records.
fn pack_transform(transform: Mat4) -> [f32; 12] {
    let rows = transform.transpose().to_cols_array();
    let mut matrix = [0.0; 12];
    matrix.copy_from_slice(&rows[..12]);
    matrix
}

fn upload_table<T: Copy>(context: &Context, data: &[T]) -> Result<Buffer> {
    vkrt::utils::create_gpu_only_buffer_from_data(
        context,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        data,
    )
}

fn upload_textures(context: &Context, scene: &Scene) -> Result<Vec<Texture>> {
    scene
        .textures
        .iter()
        .map(|texture| {
            ensure!(
                texture.channels == 4,
                "textures must be 4-channel RGBA, got {} channels",
                texture.channels
            );
            let format = if texture.srgb {
                vk::Format::R8G8B8A8_SRGB
            } else {
                vk::Format::R8G8B8A8_UNORM
            };

            let image = context.create_image(
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                format,
                texture.width,
                texture.height,
            )?;

            let staging = context.create_buffer(
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                texture.pixels.len() as _,
            )?;
            staging.copy_data_to_buffer(&texture.pixels)?;

            context.execute_one_time_commands(|cmd_buffer| {
                cmd_buffer.pipeline_image_barriers(&[ImageBarrier {
                    image: &image,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    src_access_mask: vk::AccessFlags2::empty(),
                    dst_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
                    src_stage_mask: vk::PipelineStageFlags2::NONE,
                    dst_stage_mask: vk::PipelineStageFlags2::TRANSFER,
                }]);
                cmd_buffer.copy_buffer_to_image(
                    &staging,
                    &image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                cmd_buffer.pipeline_image_barriers(&[ImageBarrier {
                    image: &image,
                    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
                    dst_access_mask: vk::AccessFlags2::SHADER_READ,
                    src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
                    dst_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                }]);
            })?;

            Ok(Texture {
                view: image.create_image_view()?,
                _image: image,
            })
        })
        .collect()
}

fn layout_binding(
    binding: u32,
    descriptor_type: vk::DescriptorType,
    count: u32,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(descriptor_type)
        .descriptor_count(count)
        .stage_flags(stages)
        .build()
}

/// Set 0 carries the scene-wide bindings; sets 1-5 are the per-geometry
/// buffer tables (index, vertex, normal, uv, color) as runtime arrays, set
/// 6 the texture array. Empty tables keep a one-element layout so the set
/// indices stay stable.
fn build_raytracing_pipeline(
    context: &Context,
    shaders: &ShaderLibrary,
    tables: &GeometryTables,
    texture_count: usize,
) -> Result<PipelineResources> {
    let raygen = Arc::new(context.create_shader_module(&shaders.raygen)?);
    let miss = Arc::new(context.create_shader_module(&shaders.miss)?);
    let occlusion_miss = Arc::new(context.create_shader_module(&shaders.occlusion_miss)?);
    let closest_hit = Arc::new(context.create_shader_module(&shaders.closest_hit)?);

    let hit_stages = vk::ShaderStageFlags::CLOSEST_HIT_KHR;
    let mut set_layouts = vec![context.create_descriptor_set_layout(&[
        layout_binding(
            0,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        layout_binding(
            1,
            vk::DescriptorType::STORAGE_IMAGE,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        layout_binding(
            2,
            vk::DescriptorType::STORAGE_IMAGE,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        layout_binding(
            3,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        layout_binding(
            4,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR | hit_stages,
        ),
        layout_binding(
            5,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::RAYGEN_KHR | hit_stages,
        ),
    ])?];

    for table_len in [
        tables.index.len(),
        tables.vertex.len(),
        tables.normal.len(),
        tables.uv.len(),
        tables.color.len(),
    ] {
        set_layouts.push(context.create_descriptor_set_layout(&[layout_binding(
            0,
            vk::DescriptorType::STORAGE_BUFFER,
            table_len.max(1) as u32,
            hit_stages,
        )])?);
    }

    set_layouts.push(context.create_descriptor_set_layout(&[layout_binding(
        0,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        texture_count.max(1) as u32,
        hit_stages,
    )])?);

    let layout_refs = set_layouts.iter().collect::<Vec<_>>();
    let layout = context.create_pipeline_layout(&layout_refs)?;

    let pipeline = RTPipelineBuilder::new()
        .set_raygen("raygen", &raygen, "main")
        .add_miss("miss", &miss, "main")
        .add_miss("occlusion_miss", &occlusion_miss, "main")
        .add_hitgroup("closest_hit", &closest_hit, "main")
        .set_layout(&layout)
        .set_recursion_depth(1)
        .build(context)?;

    Ok(PipelineResources {
        pipeline,
        layout,
        set_layouts,
    })
}

/// One hit record per unique mesh geometry; the record parameters carry
/// the geometry's buffer table indices and material id.
fn build_shader_binding_table(
    context: &Context,
    pipeline: &RTPipeline,
    hit_params: &[HitGroupParams],
) -> Result<ShaderBindingTable> {
    let mut builder = SBTBuilder::new(pipeline)
        .set_raygen(ShaderRecord::new("raygen", "raygen", 0))
        .add_miss(ShaderRecord::new("miss", "miss", 0))
        .add_miss(ShaderRecord::new("occlusion_miss", "occlusion_miss", 0));
    for index in 0..hit_params.len() {
        builder = builder.add_hitgroup(ShaderRecord::new(
            &format!("hitgroup_{index}"),
            "closest_hit",
            size_of::<HitGroupParams>(),
        ));
    }
    let mut sbt = builder.build(context)?;

    sbt.map_sbt()?;
    for (index, params) in hit_params.iter().enumerate() {
        let dst = sbt.sbt_params(&format!("hitgroup_{index}"))?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                params as *const HitGroupParams as *const u8,
                dst,
                size_of::<HitGroupParams>(),
            );
        }
    }
    sbt.unmap_sbt()?;
    sbt.upload(context)?;

    Ok(sbt)
}

#[allow(clippy::too_many_arguments)]
fn build_descriptor_table(
    context: &Context,
    pipeline_res: &PipelineResources,
    tables: &GeometryTables,
    textures: &[Texture],
    sampler: &Sampler,
    scene_bvh: &TopLevelBvh,
    render_view: &ImageView,
    accum_view: &ImageView,
    view_params_buf: &Buffer,
    material_buf: &Buffer,
    light_buf: &Buffer,
) -> Result<DescriptorTable> {
    let buffer_table_sizes = [
        tables.index.len(),
        tables.vertex.len(),
        tables.normal.len(),
        tables.uv.len(),
        tables.color.len(),
    ];
    let storage_buffer_count =
        2 + buffer_table_sizes.iter().map(|len| (*len).max(1)).sum::<usize>();

    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: storage_buffer_count as u32,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: textures.len().max(1) as u32,
        },
    ];

    let pool = context.create_descriptor_pool(pipeline_res.set_layouts.len() as u32, &pool_sizes)?;
    let sets = pipeline_res
        .set_layouts
        .iter()
        .map(|layout| pool.allocate_set(layout))
        .collect::<Result<Vec<_>>>()?;

    sets[0].update(&[
        WriteDescriptorSet {
            binding: 0,
            kind: WriteDescriptorSetKind::AccelerationStructure {
                top_level: scene_bvh,
            },
        },
        WriteDescriptorSet {
            binding: 1,
            kind: WriteDescriptorSetKind::StorageImage {
                view: render_view,
                layout: vk::ImageLayout::GENERAL,
            },
        },
        WriteDescriptorSet {
            binding: 2,
            kind: WriteDescriptorSetKind::StorageImage {
                view: accum_view,
                layout: vk::ImageLayout::GENERAL,
            },
        },
        WriteDescriptorSet {
            binding: 3,
            kind: WriteDescriptorSetKind::UniformBuffer {
                buffer: view_params_buf,
            },
        },
        WriteDescriptorSet {
            binding: 4,
            kind: WriteDescriptorSetKind::StorageBuffer {
                buffer: material_buf,
            },
        },
        WriteDescriptorSet {
            binding: 5,
            kind: WriteDescriptorSetKind::StorageBuffer { buffer: light_buf },
        },
    ]);

    let buffer_tables = [
        &tables.index,
        &tables.vertex,
        &tables.normal,
        &tables.uv,
        &tables.color,
    ];
    for (set, table) in sets[1..6].iter().zip(buffer_tables) {
        if table.is_empty() {
            continue;
        }
        let refs = table.iter().map(Arc::as_ref).collect::<Vec<_>>();
        set.update(&[WriteDescriptorSet {
            binding: 0,
            kind: WriteDescriptorSetKind::StorageBufferArray { buffers: &refs },
        }]);
    }

    if !textures.is_empty() {
        let views = textures.iter().map(|t| &t.view).collect::<Vec<_>>();
        sets[6].update(&[WriteDescriptorSet {
            binding: 0,
            kind: WriteDescriptorSetKind::CombinedImageSamplerArray {
                views: &views,
                sampler,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        }]);
    }

    Ok(DescriptorTable { sets, _pool: pool })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_offsets_accumulate_geometry_counts() {
        assert_eq!(hitgroup_record_offsets(&[1, 1, 1]), vec![0, 1, 2]);
        assert_eq!(hitgroup_record_offsets(&[3, 1, 2]), vec![0, 3, 4]);
        assert_eq!(hitgroup_record_offsets(&[]), Vec::<u32>::new());
    }

    #[test]
    fn transforms_pack_row_major() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let packed = pack_transform(transform);

        assert_eq!(
            packed,
            [
                1.0, 0.0, 0.0, 1.0, //
                0.0, 1.0, 0.0, 2.0, //
                0.0, 0.0, 1.0, 3.0,
            ]
        );
    }

    #[test]
    fn hit_record_params_are_six_words() {
        assert_eq!(size_of::<HitGroupParams>(), 24);
    }
}
