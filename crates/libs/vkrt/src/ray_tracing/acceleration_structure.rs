use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use ash::vk;
use ash::vk::Packed24_8;
use gpu_allocator::MemoryLocation;

use crate::utils::create_gpu_only_buffer_from_data;
use crate::{Buffer, CommandBuffer, CompactedSizeQueryPool, Context, Fence, RayTracingContext};

/// Vertex positions are tightly packed `vec3<f32>`, indices are `u32`
/// triangle lists. Buffer sizes determine the vertex/triangle counts.
const VERTEX_STRIDE: vk::DeviceSize = 12;
const INDEX_SIZE: vk::DeviceSize = 4;

/// One buildable geometry of a mesh. Vertex and index buffers feed the
/// build; normal/uv/color buffers ride along so descriptor tables can
/// reference them, and may be shared across geometries when deduplicated
/// upstream.
pub struct Geometry {
    pub vertex_buf: Arc<Buffer>,
    pub index_buf: Arc<Buffer>,
    pub normal_buf: Option<Arc<Buffer>>,
    pub uv_buf: Option<Arc<Buffer>>,
    pub color_buf: Option<Arc<Buffer>>,
    opaque: bool,
}

impl Geometry {
    pub fn new(
        vertex_buf: Arc<Buffer>,
        index_buf: Arc<Buffer>,
        normal_buf: Option<Arc<Buffer>>,
        uv_buf: Option<Arc<Buffer>>,
        color_buf: Option<Arc<Buffer>>,
        opaque: bool,
    ) -> Self {
        Self {
            vertex_buf,
            index_buf,
            normal_buf,
            uv_buf,
            color_buf,
            opaque,
        }
    }

    pub fn vertex_count(&self) -> u32 {
        (self.vertex_buf.size / VERTEX_STRIDE) as u32
    }

    pub fn triangle_count(&self) -> u32 {
        (self.index_buf.size / (3 * INDEX_SIZE)) as u32
    }

    fn build_input(
        &self,
    ) -> (
        vk::AccelerationStructureGeometryKHR,
        vk::AccelerationStructureBuildRangeInfoKHR,
        u32,
    ) {
        let triangle_count = self.triangle_count();

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertex_buf.get_device_address(),
            })
            .vertex_stride(VERTEX_STRIDE)
            .max_vertex(self.vertex_count())
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.index_buf.get_device_address(),
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(if self.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            })
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .build();

        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(triangle_count)
            .build();

        (geometry, range, triangle_count)
    }
}

/// Build progress of an acceleration structure. Transitions are gated on
/// fence completion tokens, so a dependent stage cannot be enqueued before
/// the GPU finished the stage it reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelBuildState {
    Unbuilt,
    Building,
    Built,
    Compacting,
    Compacted,
    Finalized,
}

impl AccelBuildState {
    fn advance(self, next: Self) -> Result<Self> {
        use AccelBuildState::*;

        let legal = matches!(
            (self, next),
            (Unbuilt, Building)
                | (Building, Built)
                | (Built, Compacting)
                | (Compacting, Compacted)
                | (Built, Finalized)
                | (Compacted, Finalized)
        );
        ensure!(
            legal,
            "illegal acceleration structure transition {self:?} -> {next:?}"
        );

        Ok(next)
    }
}

/// Bottom level acceleration structure over one mesh's geometries.
///
/// Protocol: `enqueue_build` records the build into the caller's command
/// buffer; once that submission's fence has been waited on, `mark_built`
/// accepts it as a completion token. Compaction (when the build flags allow
/// it) follows the same enqueue/mark pattern on a second submission.
/// `finalize` releases scratch memory, swaps in the compacted structure
/// when one exists, and resolves the device address; it must run exactly
/// once, after the last stage completed.
pub struct TriangleMesh {
    ray_tracing: Arc<RayTracingContext>,
    geometries: Vec<Geometry>,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    state: AccelBuildState,
    inner: vk::AccelerationStructureKHR,
    buffer: Option<Buffer>,
    scratch: Option<Buffer>,
    query_pool: Option<CompactedSizeQueryPool>,
    compacted: Option<(vk::AccelerationStructureKHR, Buffer)>,
    address: u64,
}

impl TriangleMesh {
    pub const DEFAULT_BUILD_FLAGS: vk::BuildAccelerationStructureFlagsKHR =
        vk::BuildAccelerationStructureFlagsKHR::from_raw(
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw()
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION.as_raw(),
        );

    pub fn new(
        context: &Context,
        geometries: Vec<Geometry>,
        build_flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<Self> {
        ensure!(
            !geometries.is_empty(),
            "a bottom level structure needs at least one geometry"
        );

        Ok(Self {
            ray_tracing: context.ray_tracing.clone(),
            geometries,
            build_flags,
            state: AccelBuildState::Unbuilt,
            inner: vk::AccelerationStructureKHR::null(),
            buffer: None,
            scratch: None,
            query_pool: None,
            compacted: None,
            address: 0,
        })
    }

    /// Records the build commands followed by a hazard barrier, and a
    /// compacted-size query when compaction is enabled. Geometry buffers
    /// must already be populated on the device.
    pub fn enqueue_build(&mut self, context: &Context, cmd_buffer: &CommandBuffer) -> Result<()> {
        self.state = self.state.advance(AccelBuildState::Building)?;

        let mut geometries = Vec::with_capacity(self.geometries.len());
        let mut ranges = Vec::with_capacity(self.geometries.len());
        let mut max_primitive_counts = Vec::with_capacity(self.geometries.len());
        for geometry in &self.geometries {
            let (geo, range, count) = geometry.build_input();
            geometries.push(geo);
            ranges.push(range);
            max_primitive_counts.push(count);
        }

        let build_geo_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.build_flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let build_size = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_geo_info,
                    &max_primitive_counts,
                )
        };

        let buffer = context.create_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            build_size.acceleration_structure_size,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner)
            .size(build_size.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        self.inner = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)?
        };

        let scratch = context.create_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            build_size.build_scratch_size,
        )?;

        let build_geo_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.build_flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .dst_acceleration_structure(self.inner)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.get_device_address(),
            });

        cmd_buffer.build_acceleration_structures(&build_geo_info, &ranges);
        cmd_buffer.acceleration_structure_barrier();

        if self.compaction_enabled() {
            let query_pool = context.create_compacted_size_query_pool(1)?;
            cmd_buffer.write_compacted_size_query(self.inner, &query_pool, 0);
            self.query_pool = Some(query_pool);
        }

        log::debug!(
            "enqueued bottom level build: {} geometries, {} bytes",
            self.geometries.len(),
            build_size.acceleration_structure_size
        );

        self.buffer = Some(buffer);
        self.scratch = Some(scratch);

        Ok(())
    }

    /// Accepts the fence the build submission was waited on as the
    /// completion token for the build stage.
    pub fn mark_built(&mut self, build_done: &Fence) -> Result<()> {
        ensure!(
            build_done.is_signaled()?,
            "bottom level build fence has not signaled"
        );
        self.state = self.state.advance(AccelBuildState::Built)?;

        Ok(())
    }

    /// Reads the compacted size recorded during the build and records the
    /// compacting copy into a fresh, smaller structure. Only legal once the
    /// build completed (`mark_built`) and only when the structure was built
    /// with compaction enabled.
    pub fn enqueue_compaction(
        &mut self,
        context: &Context,
        cmd_buffer: &CommandBuffer,
    ) -> Result<()> {
        self.state = self.state.advance(AccelBuildState::Compacting)?;

        let query_pool = self
            .query_pool
            .as_ref()
            .ok_or_else(|| anyhow!("structure was built without compaction enabled"))?;
        let compacted_size = query_pool.wait_for_result(0)?;
        log::debug!(
            "compacting bottom level structure: {} -> {} bytes",
            self.buffer.as_ref().map(|b| b.size).unwrap_or(0),
            compacted_size
        );

        let buffer = context.create_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            compacted_size,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner)
            .size(compacted_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        let compacted = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)?
        };

        cmd_buffer.copy_acceleration_structure_compacted(self.inner, compacted);
        self.compacted = Some((compacted, buffer));

        Ok(())
    }

    /// Completion token for the compaction copy.
    pub fn mark_compacted(&mut self, compaction_done: &Fence) -> Result<()> {
        ensure!(
            compaction_done.is_signaled()?,
            "compaction fence has not signaled"
        );
        self.state = self.state.advance(AccelBuildState::Compacted)?;

        Ok(())
    }

    /// Releases scratch memory and the size query, swaps in the compacted
    /// structure when one exists, and resolves the device address. Exactly
    /// once, after the build (or compaction) completed.
    pub fn finalize(&mut self) -> Result<()> {
        self.state = self.state.advance(AccelBuildState::Finalized)?;

        self.scratch = None;
        self.query_pool = None;

        if let Some((compacted, buffer)) = self.compacted.take() {
            unsafe {
                self.ray_tracing
                    .acceleration_structure_fn
                    .destroy_acceleration_structure(self.inner, None)
            };
            self.inner = compacted;
            self.buffer = Some(buffer);
        }

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(self.inner);
        self.address = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(())
    }

    pub fn compaction_enabled(&self) -> bool {
        self.build_flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
    }

    pub fn state(&self) -> AccelBuildState {
        self.state
    }

    pub fn geometries(&self) -> &[Geometry] {
        &self.geometries
    }

    /// Non-zero only after `finalize`.
    pub fn address(&self) -> u64 {
        self.address
    }
}

impl Drop for TriangleMesh {
    fn drop(&mut self) {
        unsafe {
            if let Some((compacted, _)) = self.compacted.take() {
                self.ray_tracing
                    .acceleration_structure_fn
                    .destroy_acceleration_structure(compacted, None);
            }
            if self.inner != vk::AccelerationStructureKHR::null() {
                self.ray_tracing
                    .acceleration_structure_fn
                    .destroy_acceleration_structure(self.inner, None);
            }
        }
    }
}

/// One placement of a bottom level structure in the scene: transform,
/// custom index (24 bits, resolved by shaders to per-instance bindings),
/// visibility mask, SBT record offset (24 bits) and instance flags.
pub struct MeshInstance {
    pub transform: [f32; 12],
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    blas_address: u64,
}

impl MeshInstance {
    /// Referencing a mesh that has not been finalized is an ordering
    /// violation the hardware cannot detect, so it is rejected here.
    pub fn new(
        mesh: &TriangleMesh,
        transform: [f32; 12],
        custom_index: u32,
        mask: u8,
        sbt_record_offset: u32,
        flags: vk::GeometryInstanceFlagsKHR,
    ) -> Result<Self> {
        ensure!(
            mesh.state() == AccelBuildState::Finalized && mesh.address() != 0,
            "instance references a bottom level structure that is not finalized"
        );

        Ok(Self {
            transform,
            custom_index,
            mask,
            sbt_record_offset,
            flags,
            blas_address: mesh.address(),
        })
    }

    pub fn blas_address(&self) -> u64 {
        self.blas_address
    }

    pub(crate) fn packed(&self) -> vk::AccelerationStructureInstanceKHR {
        pack_instance(
            self.transform,
            self.custom_index,
            self.mask,
            self.sbt_record_offset,
            self.flags,
            self.blas_address,
        )
    }
}

fn pack_instance(
    transform: [f32; 12],
    custom_index: u32,
    mask: u8,
    sbt_record_offset: u32,
    flags: vk::GeometryInstanceFlagsKHR,
    blas_address: u64,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: vk::TransformMatrixKHR { matrix: transform },
        instance_custom_index_and_mask: Packed24_8::new(custom_index, mask),
        instance_shader_binding_table_record_offset_and_flags: Packed24_8::new(
            sbt_record_offset,
            flags.as_raw() as _,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// Top level acceleration structure over the scene's instances. The packed
/// instance records live in a device-local buffer created at construction;
/// the build itself follows the same enqueue/mark/finalize protocol as the
/// bottom level, minus compaction.
pub struct TopLevelBvh {
    ray_tracing: Arc<RayTracingContext>,
    instances: Vec<MeshInstance>,
    instance_buffer: Buffer,
    state: AccelBuildState,
    inner: vk::AccelerationStructureKHR,
    buffer: Option<Buffer>,
    scratch: Option<Buffer>,
    address: u64,
}

impl TopLevelBvh {
    pub fn new(context: &Context, instances: Vec<MeshInstance>) -> Result<Self> {
        ensure!(
            !instances.is_empty(),
            "a top level structure needs at least one instance"
        );

        let packed = instances.iter().map(|i| i.packed()).collect::<Vec<_>>();
        let instance_buffer = create_gpu_only_buffer_from_data(
            context,
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            &packed,
        )?;

        Ok(Self {
            ray_tracing: context.ray_tracing.clone(),
            instances,
            instance_buffer,
            state: AccelBuildState::Unbuilt,
            inner: vk::AccelerationStructureKHR::null(),
            buffer: None,
            scratch: None,
            address: 0,
        })
    }

    pub fn enqueue_build(&mut self, context: &Context, cmd_buffer: &CommandBuffer) -> Result<()> {
        self.state = self.state.advance(AccelBuildState::Building)?;

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.instance_buffer.get_device_address(),
                    })
                    .build(),
            })
            .build();

        let instance_count = self.instances.len() as u32;

        let build_geo_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let build_size = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_geo_info,
                    &[instance_count],
                )
        };

        let buffer = context.create_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            build_size.acceleration_structure_size,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner)
            .size(build_size.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        self.inner = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)?
        };

        let scratch = context.create_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            build_size.build_scratch_size,
        )?;

        let build_geo_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry))
            .dst_acceleration_structure(self.inner)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.get_device_address(),
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(instance_count)
            .build();

        cmd_buffer.build_acceleration_structures(&build_geo_info, &[range]);
        cmd_buffer.acceleration_structure_barrier();

        log::debug!(
            "enqueued top level build: {} instances, {} bytes",
            instance_count,
            build_size.acceleration_structure_size
        );

        self.buffer = Some(buffer);
        self.scratch = Some(scratch);

        Ok(())
    }

    pub fn mark_built(&mut self, build_done: &Fence) -> Result<()> {
        ensure!(
            build_done.is_signaled()?,
            "top level build fence has not signaled"
        );
        self.state = self.state.advance(AccelBuildState::Built)?;

        Ok(())
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.state = self.state.advance(AccelBuildState::Finalized)?;
        self.scratch = None;

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(self.inner);
        self.address = unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(())
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn instances(&self) -> &[MeshInstance] {
        &self.instances
    }

    pub fn state(&self) -> AccelBuildState {
        self.state
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub(crate) fn handle_ref(&self) -> &vk::AccelerationStructureKHR {
        &self.inner
    }
}

impl Drop for TopLevelBvh {
    fn drop(&mut self) {
        unsafe {
            if self.inner != vk::AccelerationStructureKHR::null() {
                self.ray_tracing
                    .acceleration_structure_fn
                    .destroy_acceleration_structure(self.inner, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_states_only_advance_along_the_protocol() {
        use AccelBuildState::*;

        assert_eq!(Unbuilt.advance(Building).unwrap(), Building);
        assert_eq!(Building.advance(Built).unwrap(), Built);
        assert_eq!(Built.advance(Compacting).unwrap(), Compacting);
        assert_eq!(Compacting.advance(Compacted).unwrap(), Compacted);
        assert_eq!(Compacted.advance(Finalized).unwrap(), Finalized);

        // Skipping compaction is legal.
        assert_eq!(Built.advance(Finalized).unwrap(), Finalized);

        // Compaction before the build completed is not.
        assert!(Building.advance(Compacting).is_err());
        // Finalize before the build completed is not.
        assert!(Building.advance(Finalized).is_err());
        // Finalize is single-shot.
        assert!(Finalized.advance(Finalized).is_err());
        // Nothing restarts a consumed structure.
        assert!(Finalized.advance(Building).is_err());
    }

    #[test]
    fn instance_records_pack_into_the_device_layout() {
        let transform = [
            1.0, 0.0, 0.0, 10.0, //
            0.0, 1.0, 0.0, 20.0, //
            0.0, 0.0, 1.0, 30.0,
        ];
        let record = pack_instance(
            transform,
            7,
            0xFF,
            3,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0xdead_beef,
        );

        assert_eq!(record.transform.matrix, transform);
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            3
        );
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .high_8() as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(
            unsafe { record.acceleration_structure_reference.device_handle },
            0xdead_beef
        );
    }

    #[test]
    fn custom_index_is_truncated_to_24_bits() {
        let record = pack_instance(
            [0.0; 12],
            0x0123_4567,
            0x0F,
            0,
            vk::GeometryInstanceFlagsKHR::empty(),
            1,
        );
        assert_eq!(
            record.instance_custom_index_and_mask.low_24(),
            0x0123_4567 & 0x00FF_FFFF
        );
    }

    #[test]
    fn instance_size_matches_the_device_contract() {
        assert_eq!(
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            64
        );
    }
}
