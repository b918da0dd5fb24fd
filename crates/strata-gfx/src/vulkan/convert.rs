use ash::vk;

use crate::raytracing::geometry::{AccelerationBuildFlags, AccelerationKind, GeometryFlags};
use crate::resources::buffer_desc::{BufferUsage, ResourceState};

pub(crate) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mapping = [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::DEVICE_ADDRESS, vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
        (
            BufferUsage::ACCELERATION_STORAGE,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        ),
        (
            BufferUsage::ACCELERATION_INPUT,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        ),
        (BufferUsage::SHADER_BINDING_TABLE, vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR),
    ];

    mapping
        .iter()
        .filter(|(ours, _)| usage.contains(*ours))
        .fold(vk::BufferUsageFlags::empty(), |acc, (_, flags)| acc | *flags)
}

/// 资源状态对应的 stage 和 access
pub(crate) fn state_mask(state: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match state {
        ResourceState::Common => {
            (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
        }
        ResourceState::GenericRead => (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ),
        ResourceState::CopySource => (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_READ),
        ResourceState::CopyDest => (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE),
        ResourceState::UnorderedAccess => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        ResourceState::AccelerationStructure => (
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
    }
}

pub(crate) fn acceleration_type(kind: AccelerationKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

pub(crate) fn build_flags(flags: AccelerationBuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(AccelerationBuildFlags::PREFER_FAST_TRACE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(AccelerationBuildFlags::ALLOW_UPDATE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    out
}

pub(crate) fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut out = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        out |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION) {
        out |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    out
}
