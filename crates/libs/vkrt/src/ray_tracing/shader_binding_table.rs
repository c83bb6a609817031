use std::collections::HashMap;

use anyhow::{anyhow, ensure, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::{
    utils::compute_aligned_size, Buffer, BufferBarrier, CommandBuffer, Context, RTPipeline,
};

/// Descriptor for one shader binding table entry: a logical record name,
/// the pipeline shader group it binds to, and the size of the parameter
/// block trailing the group identifier.
#[derive(Debug, Clone)]
pub struct ShaderRecord {
    pub name: String,
    pub group: String,
    pub param_size: usize,
}

impl ShaderRecord {
    pub fn new(name: &str, group: &str, param_size: usize) -> Self {
        Self {
            name: name.to_owned(),
            group: group.to_owned(),
            param_size,
        }
    }
}

/// Byte layout of the three SBT regions. Every region uses one fixed
/// stride, the maximum record size of that region rounded up to the
/// handle alignment, since the hardware dispatch addresses records as
/// `base + index * stride`. Region starts are rounded up to the shader
/// group base alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SbtLayout {
    pub ident_size: usize,
    pub raygen_stride: usize,
    pub miss_start: usize,
    pub miss_stride: usize,
    pub hitgroup_start: usize,
    pub hitgroup_stride: usize,
    pub total_size: usize,
}

fn region_stride(ident_size: usize, handle_alignment: usize, records: &[ShaderRecord]) -> usize {
    records
        .iter()
        .map(|r| compute_aligned_size(ident_size + r.param_size, handle_alignment))
        .max()
        .unwrap_or(0)
}

fn compute_layout(
    ident_size: usize,
    handle_alignment: usize,
    base_alignment: usize,
    raygen: &ShaderRecord,
    miss: &[ShaderRecord],
    hitgroups: &[ShaderRecord],
) -> SbtLayout {
    let raygen_stride = compute_aligned_size(ident_size + raygen.param_size, handle_alignment);

    let miss_start = compute_aligned_size(raygen_stride, base_alignment);
    let miss_stride = region_stride(ident_size, handle_alignment, miss);

    let hitgroup_start =
        compute_aligned_size(miss_start + miss.len() * miss_stride, base_alignment);
    let hitgroup_stride = region_stride(ident_size, handle_alignment, hitgroups);

    let total_size = compute_aligned_size(
        hitgroup_start + hitgroups.len() * hitgroup_stride,
        base_alignment,
    );

    SbtLayout {
        ident_size,
        raygen_stride,
        miss_start,
        miss_stride,
        hitgroup_start,
        hitgroup_stride,
        total_size,
    }
}

/// Offset of every record's parameter block (right after its identifier)
/// within the table, keyed by the record's logical name.
fn assign_param_offsets(
    layout: &SbtLayout,
    raygen: &ShaderRecord,
    miss: &[ShaderRecord],
    hitgroups: &[ShaderRecord],
) -> Result<HashMap<String, usize>> {
    let mut offsets = HashMap::new();

    let mut insert = |name: &str, offset: usize| -> Result<()> {
        ensure!(
            offsets.insert(name.to_owned(), offset).is_none(),
            "duplicate shader record name {name:?}"
        );
        Ok(())
    };

    insert(&raygen.name, layout.ident_size)?;
    for (index, record) in miss.iter().enumerate() {
        insert(
            &record.name,
            layout.miss_start + index * layout.miss_stride + layout.ident_size,
        )?;
    }
    for (index, record) in hitgroups.iter().enumerate() {
        insert(
            &record.name,
            layout.hitgroup_start + index * layout.hitgroup_stride + layout.ident_size,
        )?;
    }

    Ok(offsets)
}

/// Builds a shader binding table against an already-built pipeline, which
/// resolves the shader group identifiers by name.
pub struct SBTBuilder<'a> {
    pipeline: &'a RTPipeline,
    raygen: Option<ShaderRecord>,
    miss_records: Vec<ShaderRecord>,
    hitgroups: Vec<ShaderRecord>,
}

impl<'a> SBTBuilder<'a> {
    pub fn new(pipeline: &'a RTPipeline) -> Self {
        Self {
            pipeline,
            raygen: None,
            miss_records: vec![],
            hitgroups: vec![],
        }
    }

    pub fn set_raygen(mut self, record: ShaderRecord) -> Self {
        self.raygen = Some(record);
        self
    }

    pub fn add_miss(mut self, record: ShaderRecord) -> Self {
        self.miss_records.push(record);
        self
    }

    pub fn add_hitgroup(mut self, record: ShaderRecord) -> Self {
        self.hitgroups.push(record);
        self
    }

    /// Lays the records out, writes every record's identifier into a
    /// host-visible staging copy with zeroed parameter blocks, and uploads
    /// it to the device-local table used by ray dispatches. Records naming
    /// a shader group the pipeline does not contain fail here, before any
    /// allocation.
    pub fn build(self, context: &Context) -> Result<ShaderBindingTable> {
        let raygen = self
            .raygen
            .ok_or_else(|| anyhow!("shader binding table has no raygen record"))?;

        // Resolve all identifiers up front so configuration errors surface
        // before any buffer exists.
        let mut idents = Vec::with_capacity(1 + self.miss_records.len() + self.hitgroups.len());
        for record in std::iter::once(&raygen)
            .chain(self.miss_records.iter())
            .chain(self.hitgroups.iter())
        {
            idents.push(self.pipeline.shader_ident(&record.group)?.to_vec());
        }

        let props = &context.ray_tracing.pipeline_properties;
        let layout = compute_layout(
            self.pipeline.shader_ident_size(),
            props.shader_group_handle_alignment as usize,
            props.shader_group_base_alignment as usize,
            &raygen,
            &self.miss_records,
            &self.hitgroups,
        );
        let param_offsets =
            assign_param_offsets(&layout, &raygen, &self.miss_records, &self.hitgroups)?;

        let upload = context.create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            layout.total_size as _,
        )?;

        let mapping = upload.map()?;
        unsafe {
            std::ptr::write_bytes(mapping, 0, layout.total_size);

            let mut slots = vec![0usize];
            slots.extend(
                (0..self.miss_records.len())
                    .map(|i| layout.miss_start + i * layout.miss_stride),
            );
            slots.extend(
                (0..self.hitgroups.len())
                    .map(|i| layout.hitgroup_start + i * layout.hitgroup_stride),
            );

            for (slot, ident) in slots.into_iter().zip(idents.iter()) {
                std::ptr::copy_nonoverlapping(ident.as_ptr(), mapping.add(slot), ident.len());
            }
        }
        upload.unmap()?;

        let buffer = context.create_buffer(
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            layout.total_size as _,
        )?;

        context.execute_one_time_commands(|cmd_buffer| {
            cmd_buffer.copy_buffer(&upload, &buffer);
        })?;

        let address = buffer.get_device_address();

        let raygen_region = vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(address)
            .size(layout.raygen_stride as _)
            .stride(layout.raygen_stride as _)
            .build();

        let miss_region = vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(address + layout.miss_start as u64)
            .size((self.miss_records.len() * layout.miss_stride) as _)
            .stride(layout.miss_stride as _)
            .build();

        let hit_region = vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(address + layout.hitgroup_start as u64)
            .size((self.hitgroups.len() * layout.hitgroup_stride) as _)
            .stride(layout.hitgroup_stride as _)
            .build();

        Ok(ShaderBindingTable {
            upload,
            buffer,
            param_offsets,
            mapping: None,
            raygen_region,
            miss_region,
            hit_region,
        })
    }
}

/// One raygen record, the miss records and the hit group records laid out
/// into a device-local buffer, plus the host-visible staging copy that
/// record parameters are written through.
pub struct ShaderBindingTable {
    upload: Buffer,
    buffer: Buffer,
    param_offsets: HashMap<String, usize>,
    mapping: Option<*mut u8>,
    pub(crate) raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub(crate) miss_region: vk::StridedDeviceAddressRegionKHR,
    pub(crate) hit_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Opens host access to the staging copy. Pair with `unmap_sbt`, then
    /// `upload` the table for the parameters to reach the device.
    pub fn map_sbt(&mut self) -> Result<()> {
        ensure!(self.mapping.is_none(), "shader binding table already mapped");
        self.mapping = Some(self.upload.map()?);

        Ok(())
    }

    /// Start of the named record's parameter block inside the mapped
    /// staging copy.
    pub fn sbt_params(&self, name: &str) -> Result<*mut u8> {
        let mapping = self
            .mapping
            .ok_or_else(|| anyhow!("shader binding table is not mapped"))?;
        let offset = *self
            .param_offsets
            .get(name)
            .ok_or_else(|| anyhow!("no shader binding table entry for record {name:?}"))?;

        Ok(unsafe { mapping.add(offset) })
    }

    pub fn unmap_sbt(&mut self) -> Result<()> {
        ensure!(self.mapping.take().is_some(), "shader binding table is not mapped");
        self.upload.unmap()?;

        Ok(())
    }

    /// Records the staging-to-device copy and the transfer-to-trace
    /// barrier into the caller's command buffer.
    pub fn enqueue_upload(&self, cmd_buffer: &CommandBuffer) {
        cmd_buffer.copy_buffer(&self.upload, &self.buffer);
        cmd_buffer.pipeline_buffer_barriers(&[BufferBarrier {
            buffer: &self.buffer,
            src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags2::SHADER_READ,
            src_stage_mask: vk::PipelineStageFlags2::TRANSFER,
            dst_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        }]);
    }

    /// Immediate upload through a one-time submission.
    pub fn upload(&self, context: &Context) -> Result<()> {
        ensure!(
            self.mapping.is_none(),
            "unmap the shader binding table before uploading it"
        );
        context.execute_one_time_commands(|cmd_buffer| {
            cmd_buffer.copy_buffer(&self.upload, &self.buffer);
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT: usize = 32;
    const HANDLE_ALIGN: usize = 32;
    const BASE_ALIGN: usize = 64;

    fn record(name: &str, param_size: usize) -> ShaderRecord {
        ShaderRecord::new(name, name, param_size)
    }

    #[test]
    fn region_starts_are_base_aligned() {
        let miss = [record("miss", 0), record("shadow_miss", 8)];
        let hits = [record("hit0", 24), record("hit1", 4)];
        let layout = compute_layout(
            IDENT,
            HANDLE_ALIGN,
            BASE_ALIGN,
            &record("raygen", 16),
            &miss,
            &hits,
        );

        assert_eq!(layout.miss_start % BASE_ALIGN, 0);
        assert_eq!(layout.hitgroup_start % BASE_ALIGN, 0);
        assert_eq!(layout.total_size % BASE_ALIGN, 0);
        assert!(layout.miss_start >= layout.raygen_stride);
        assert!(layout.hitgroup_start >= layout.miss_start + 2 * layout.miss_stride);
    }

    #[test]
    fn region_stride_is_the_aligned_maximum_record_size() {
        let hits = [record("hit0", 4), record("hit1", 100), record("hit2", 0)];
        let layout = compute_layout(
            IDENT,
            HANDLE_ALIGN,
            BASE_ALIGN,
            &record("raygen", 0),
            &[],
            &hits,
        );

        // Largest record is ident + 100 = 132, rounded up to the handle
        // alignment.
        assert_eq!(layout.hitgroup_stride, 160);
        assert!(hits
            .iter()
            .all(|h| layout.hitgroup_stride >= IDENT + h.param_size));
        assert_eq!(layout.hitgroup_stride % HANDLE_ALIGN, 0);
    }

    #[test]
    fn raygen_stride_covers_identifier_and_params() {
        let layout = compute_layout(
            IDENT,
            HANDLE_ALIGN,
            BASE_ALIGN,
            &record("raygen", 20),
            &[],
            &[],
        );
        assert_eq!(layout.raygen_stride, 64);
        assert_eq!(layout.miss_stride, 0);
        assert_eq!(layout.hitgroup_stride, 0);
    }

    #[test]
    fn param_offsets_trail_each_records_identifier() {
        let raygen = record("raygen", 16);
        let miss = [record("miss", 0), record("shadow_miss", 8)];
        let hits = [record("mesh0", 24)];
        let layout = compute_layout(IDENT, HANDLE_ALIGN, BASE_ALIGN, &raygen, &miss, &hits);
        let offsets = assign_param_offsets(&layout, &raygen, &miss, &hits).unwrap();

        assert_eq!(offsets["raygen"], IDENT);
        assert_eq!(offsets["miss"], layout.miss_start + IDENT);
        assert_eq!(
            offsets["shadow_miss"],
            layout.miss_start + layout.miss_stride + IDENT
        );
        assert_eq!(offsets["mesh0"], layout.hitgroup_start + IDENT);
    }

    #[test]
    fn duplicate_record_names_are_rejected() {
        let raygen = record("raygen", 0);
        let miss = [record("raygen", 0)];
        let layout = compute_layout(IDENT, HANDLE_ALIGN, BASE_ALIGN, &raygen, &miss, &[]);
        assert!(assign_param_offsets(&layout, &raygen, &miss, &[]).is_err());
    }
}
