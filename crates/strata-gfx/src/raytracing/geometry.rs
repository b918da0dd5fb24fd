use bitflags::bitflags;

use crate::resources::handles::GfxBufferHandle;

/// 顶点格式固定为 3 个 f32
pub const TRIANGLE_VERTEX_SIZE: u64 = 3 * size_of::<f32>() as u64;
/// 索引格式固定为 u32，每个三角形 3 个索引
pub const TRIANGLE_INDEX_STRIDE: u64 = 3 * size_of::<u32>() as u64;
/// 一个 AABB 是 min/max 两个 float3
pub const AABB_SIZE: u64 = 6 * size_of::<f32>() as u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANYHIT_INVOCATION = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccelerationBuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const PREFER_FAST_TRACE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationKind {
    BottomLevel,
    TopLevel,
}

/// 程序化几何体：紧密或按 stride 排布的 AABB 数组
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AabbGeometry {
    pub buffer: GfxBufferHandle,
    pub offset: u64,
    pub stride: u64,
    pub count: u32,
    pub flags: GeometryFlags,
}

/// 带索引的三角形几何体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_buffer: GfxBufferHandle,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub index_buffer: GfxBufferHandle,
    pub primitive_count: u32,
    pub flags: GeometryFlags,
}

impl TriangleGeometry {
    #[inline]
    pub fn index_count(&self) -> u32 {
        self.primitive_count * 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryDesc {
    Aabbs(AabbGeometry),
    Triangles(TriangleGeometry),
}

impl GeometryDesc {
    /// AABB 的个数或者三角形的个数
    pub fn primitive_count(&self) -> u32 {
        match self {
            GeometryDesc::Aabbs(aabbs) => aabbs.count,
            GeometryDesc::Triangles(triangles) => triangles.primitive_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationBuildPayload {
    BottomLevel(GeometryDesc),
    TopLevel {
        instance_buffer: GfxBufferHandle,
        instance_count: u32,
    },
}

/// 一次构建的全部输入，prebuild 查询和真正的构建使用同一份
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationBuildInputs {
    pub payload: AccelerationBuildPayload,
    pub flags: AccelerationBuildFlags,
}

impl AccelerationBuildInputs {
    pub fn bottom_level(geometry: GeometryDesc) -> Self {
        Self {
            payload: AccelerationBuildPayload::BottomLevel(geometry),
            flags: AccelerationBuildFlags::PREFER_FAST_TRACE,
        }
    }

    pub fn top_level(instance_buffer: GfxBufferHandle, instance_count: u32) -> Self {
        Self {
            payload: AccelerationBuildPayload::TopLevel {
                instance_buffer,
                instance_count,
            },
            flags: AccelerationBuildFlags::PREFER_FAST_TRACE | AccelerationBuildFlags::ALLOW_UPDATE,
        }
    }

    pub fn kind(&self) -> AccelerationKind {
        match self.payload {
            AccelerationBuildPayload::BottomLevel(_) => AccelerationKind::BottomLevel,
            AccelerationBuildPayload::TopLevel { .. } => AccelerationKind::TopLevel,
        }
    }

    /// BLAS 是图元个数，TLAS 是 instance 个数
    pub fn primitive_count(&self) -> u32 {
        match self.payload {
            AccelerationBuildPayload::BottomLevel(geometry) => geometry.primitive_count(),
            AccelerationBuildPayload::TopLevel { instance_count, .. } => instance_count,
        }
    }
}

/// prebuild 查询的结果，只有大小，不涉及任何分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrebuildSizes {
    pub result_size: u64,
    pub scratch_size: u64,
}
