use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NON_OPAQUE = 1 << 3;
    }
}

/// instance id 和 hit group offset 都只有 24 位
pub const INSTANCE_FIELD_MAX: u32 = (1 << 24) - 1;

/// TLAS 的 instance 数据，和 `VkAccelerationStructureInstanceKHR` 的内存布局一致
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuInstanceRecord {
    /// 行主序的 3x4 仿射变换
    pub transform: [f32; 12],
    /// 低 24 位是 instance id，高 8 位是 mask
    pub instance_id_and_mask: u32,
    /// 低 24 位是 hit group 的偏移，高 8 位是 flags
    pub hit_group_offset_and_flags: u32,
    /// BLAS 的设备地址
    pub acceleration_structure: u64,
}

const _: () = assert!(size_of::<GpuInstanceRecord>() == 64);

impl GpuInstanceRecord {
    pub const SIZE: u64 = size_of::<GpuInstanceRecord>() as u64;

    pub fn new(
        transform: &glam::Mat4,
        instance_id: u32,
        mask: u8,
        hit_group_offset: u32,
        flags: InstanceFlags,
        acceleration_structure: u64,
    ) -> Self {
        Self {
            transform: Self::row_major_transform(transform),
            instance_id_and_mask: pack_24_8(instance_id, mask),
            hit_group_offset_and_flags: pack_24_8(hit_group_offset, flags.bits()),
            acceleration_structure,
        }
    }

    /// glam 的矩阵是列主序的，这里取前三行
    pub fn row_major_transform(mat: &glam::Mat4) -> [f32; 12] {
        let mut out = [0.0; 12];
        for row in 0..3 {
            out[row * 4..row * 4 + 4].copy_from_slice(&mat.row(row).to_array());
        }
        out
    }

    #[inline]
    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & INSTANCE_FIELD_MAX
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    #[inline]
    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset_and_flags & INSTANCE_FIELD_MAX
    }

    #[inline]
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.hit_group_offset_and_flags >> 24) as u8)
    }
}

#[inline]
fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & INSTANCE_FIELD_MAX) | ((high_8 as u32) << 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_fields() {
        let record = GpuInstanceRecord::new(
            &glam::Mat4::IDENTITY,
            7,
            0xFF,
            3,
            InstanceFlags::TRIANGLE_CULL_DISABLE,
            0xdead_beef,
        );
        assert_eq!(record.instance_id(), 7);
        assert_eq!(record.mask(), 0xFF);
        assert_eq!(record.hit_group_offset(), 3);
        assert_eq!(record.flags(), InstanceFlags::TRIANGLE_CULL_DISABLE);
        assert_eq!(record.acceleration_structure, 0xdead_beef);
    }

    #[test]
    fn test_translation_lands_in_last_column() {
        let mat = glam::Mat4::from_translation(glam::vec3(1.0, 2.0, 3.0));
        let transform = GpuInstanceRecord::row_major_transform(&mat);
        assert_eq!(transform, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn test_record_bytes() {
        let records = [GpuInstanceRecord::zeroed(); 3];
        assert_eq!(bytemuck::cast_slice::<_, u8>(&records).len(), 3 * 64);
    }
}
