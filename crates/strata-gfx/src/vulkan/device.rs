use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;

use ash::vk;
use itertools::Itertools;
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::commands::command::GfxCommand;
use crate::commands::recorder::GfxCommandRecorder;
use crate::config::GfxConfig;
use crate::device::{ExternalMemoryHandle, GfxDevice, check_range};
use crate::error::{GfxError, GfxResult};
use crate::raytracing::geometry::{
    AccelerationBuildInputs, AccelerationBuildPayload, AccelerationKind, GeometryDesc, PrebuildSizes,
    TRIANGLE_VERTEX_SIZE,
};
use crate::raytracing::pipeline::{GfxRayTracingPipeline, RayTracingPipelineDesc, ShaderTableLimits};
use crate::resources::buffer_desc::{GfxBufferDesc, MemoryClass};
use crate::resources::handles::{GfxAccelerationHandle, GfxBufferHandle};
use crate::vulkan::convert;
use crate::vulkan::pipeline::VulkanRayTracingPipeline;

/// buffer 起始地址的最小对齐，加速结构要求 256
const MIN_BUFFER_ALIGNMENT: vk::DeviceSize = 256;

enum VulkanMemory {
    Vma(vk_mem::Allocation),
    /// 可导出的独立分配，不经过 vma
    Exportable(vk::DeviceMemory),
}

struct VulkanBuffer {
    handle: vk::Buffer,
    memory: VulkanMemory,
    desc: GfxBufferDesc,
    mapped_ptr: Option<*mut u8>,
    address: Option<vk::DeviceAddress>,
}

/// 构建加速结构需要的几何信息，prebuild 查询和录制共用
struct PreparedGeometry {
    ty: vk::AccelerationStructureTypeKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometry: vk::AccelerationStructureGeometryKHR<'static>,
    primitive_count: u32,
}

enum PreparedCommand {
    Copy {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    Barrier(vk::BufferMemoryBarrier2<'static>),
    Build {
        geometry: PreparedGeometry,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    },
}

/// Vulkan 设备
///
/// 只有一个 queue，所有同步操作共享同一个 command buffer 和 fence。
pub struct VulkanDevice {
    name: String,
    frames_in_flight: usize,
    frame_index: Cell<usize>,

    _entry: ash::Entry,
    instance: ash::Instance,
    pdevice: vk::PhysicalDevice,
    device: ash::Device,
    acceleration_structure: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
    #[cfg(unix)]
    external_memory_fd: ash::khr::external_memory_fd::Device,

    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,

    /// 必须在 device 之前销毁
    allocator: ManuallyDrop<vk_mem::Allocator>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: ShaderTableLimits,
    scratch_alignment: vk::DeviceSize,

    buffers: RefCell<SlotMap<GfxBufferHandle, VulkanBuffer>>,
    accelerations: RefCell<SlotMap<GfxAccelerationHandle, vk::AccelerationStructureKHR>>,
}

// init & destroy
impl VulkanDevice {
    /// # 创建过程
    /// 1. 加载 Vulkan，创建 instance
    /// 2. 选择支持光追扩展的 physical device
    /// 3. 创建 device、queue、command pool 以及 fence
    /// 4. 创建 vma
    pub fn new(config: &GfxConfig) -> GfxResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GfxError::Unsupported(format!("failed to load vulkan loader: {e}")))?;
        let instance = Self::create_instance(&entry, config)?;

        match Self::create_with_instance(entry, instance.clone(), config) {
            Ok(device) => Ok(device),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn create_instance(entry: &ash::Entry, config: &GfxConfig) -> GfxResult<ash::Instance> {
        let app_name = CString::new(config.app_name.as_str())
            .map_err(|_| GfxError::Config("app_name contains a nul byte".to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(c"strata")
            .api_version(vk::API_VERSION_1_3);

        let layers = if config.enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };
        let instance_ci = vk::InstanceCreateInfo::default().application_info(&app_info).enabled_layer_names(&layers);

        Ok(unsafe { entry.create_instance(&instance_ci, None)? })
    }

    fn required_device_exts() -> Vec<&'static CStr> {
        let mut exts = vec![
            ash::khr::acceleration_structure::NAME,
            ash::khr::ray_tracing_pipeline::NAME,
            ash::khr::deferred_host_operations::NAME,
        ];
        #[cfg(unix)]
        exts.push(ash::khr::external_memory_fd::NAME);
        exts
    }

    fn pick_physical_device(instance: &ash::Instance) -> GfxResult<(vk::PhysicalDevice, u32)> {
        let required = Self::required_device_exts();
        let pdevices = unsafe { instance.enumerate_physical_devices()? };

        for pdevice in pdevices {
            let exts = unsafe { instance.enumerate_device_extension_properties(pdevice)? };
            let supported = required.iter().all(|req| {
                exts.iter().any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *req))
            });
            if !supported {
                continue;
            }

            let families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
            let family = families
                .iter()
                .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE));
            if let Some(family) = family {
                return Ok((pdevice, family as u32));
            }
        }

        log::error!("no physical device supports {:?}", required);
        Err(GfxError::Unsupported("no physical device supports ray tracing".to_string()))
    }

    fn create_with_instance(entry: ash::Entry, instance: ash::Instance, config: &GfxConfig) -> GfxResult<Self> {
        let (pdevice, queue_family_index) = Self::pick_physical_device(&instance)?;

        let priorities = [1.0_f32];
        let queue_ci =
            vk::DeviceQueueCreateInfo::default().queue_family_index(queue_family_index).queue_priorities(&priorities);
        let ext_ptrs = Self::required_device_exts().iter().map(|ext| ext.as_ptr()).collect_vec();

        let mut bda_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true);
        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut sync2_features = vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_ci))
            .enabled_extension_names(&ext_ptrs)
            .push_next(&mut bda_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features)
            .push_next(&mut sync2_features);
        let device = unsafe { instance.create_device(pdevice, &device_ci, None)? };

        // 光追相关的属性
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        {
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props).push_next(&mut accel_props);
            unsafe { instance.get_physical_device_properties2(pdevice, &mut props2) };
        }
        let limits = ShaderTableLimits {
            identifier_size: rt_props.shader_group_handle_size,
            record_alignment: rt_props.shader_group_handle_alignment,
            table_alignment: rt_props.shader_group_base_alignment,
        };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(pdevice) };

        let objects = (|| -> GfxResult<_> {
            let command_pool = unsafe {
                device.create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                        .queue_family_index(queue_family_index),
                    None,
                )?
            };
            let command_buffer = unsafe {
                device.allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(command_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )?
            }[0];
            let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None)? };

            let mut vma_ci = vk_mem::AllocatorCreateInfo::new(&instance, &device, pdevice);
            vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
            vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
            let allocator = unsafe { vk_mem::Allocator::new(vma_ci)? };

            Ok((command_pool, command_buffer, fence, allocator))
        })();
        let (command_pool, command_buffer, fence, allocator) = match objects {
            Ok(objects) => objects,
            Err(e) => {
                // pool 和 fence 随 device 一起丢弃
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let acceleration_structure = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let ray_tracing_pipeline = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        #[cfg(unix)]
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);

        log::info!(
            "vulkan device `{}` created: queue family {}, limits {:?}, scratch alignment {}",
            config.app_name,
            queue_family_index,
            limits,
            accel_props.min_acceleration_structure_scratch_offset_alignment
        );

        Ok(Self {
            name: format!("{}-vulkan", config.app_name),
            frames_in_flight: config.frames_in_flight.max(1),
            frame_index: Cell::new(0),
            _entry: entry,
            instance,
            pdevice,
            device,
            acceleration_structure,
            ray_tracing_pipeline,
            #[cfg(unix)]
            external_memory_fd,
            queue,
            command_pool,
            command_buffer,
            fence,
            allocator: ManuallyDrop::new(allocator),
            memory_properties,
            limits,
            scratch_alignment: (accel_props.min_acceleration_structure_scratch_offset_alignment as vk::DeviceSize)
                .max(MIN_BUFFER_ALIGNMENT),
            buffers: RefCell::new(SlotMap::with_key()),
            accelerations: RefCell::new(SlotMap::with_key()),
        })
    }

    fn release_buffer(&self, buffer: VulkanBuffer) {
        unsafe {
            match buffer.memory {
                VulkanMemory::Vma(mut allocation) => {
                    if buffer.mapped_ptr.is_some() {
                        self.allocator.unmap_memory(&mut allocation);
                    }
                    self.allocator.destroy_buffer(buffer.handle, &mut allocation);
                }
                VulkanMemory::Exportable(memory) => {
                    self.device.destroy_buffer(buffer.handle, None);
                    self.device.free_memory(memory, None);
                }
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("destroying vulkan device `{}`", self.name);
        unsafe {
            let _ = self.device.device_wait_idle();

            let accelerations = self.accelerations.get_mut().drain().map(|(_, accel)| accel).collect_vec();
            if !accelerations.is_empty() {
                log::warn!("{} acceleration structures leaked until device destruction", accelerations.len());
            }
            for accel in accelerations {
                self.acceleration_structure.destroy_acceleration_structure(accel, None);
            }

            let buffers = self.buffers.get_mut().drain().map(|(_, buffer)| buffer).collect_vec();
            if !buffers.is_empty() {
                log::warn!("{} buffers leaked until device destruction", buffers.len());
            }
            for buffer in buffers {
                self.release_buffer(buffer);
            }

            self.device.destroy_fence(self.fence, None);
            self.device.destroy_command_pool(self.command_pool, None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// getter
impl VulkanDevice {
    #[inline]
    pub fn vk_device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdevice
    }

    #[inline]
    pub fn ray_tracing_pipeline_fns(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.ray_tracing_pipeline
    }

    pub fn vk_buffer(&self, buffer: GfxBufferHandle) -> GfxResult<vk::Buffer> {
        self.buffers.borrow().get(buffer).map(|b| b.handle).ok_or(GfxError::InvalidHandle)
    }

    pub fn vk_acceleration_structure(&self, acceleration: GfxAccelerationHandle) -> GfxResult<vk::AccelerationStructureKHR> {
        self.accelerations.borrow().get(acceleration).copied().ok_or(GfxError::InvalidHandle)
    }
}

// buffer creation
impl VulkanDevice {
    fn create_vma_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<VulkanBuffer> {
        let buffer_ci = vk::BufferCreateInfo::default().size(desc.size).usage(convert::buffer_usage(desc.usage));
        let (usage, flags) = match desc.memory {
            MemoryClass::Upload => {
                (vk_mem::MemoryUsage::AutoPreferHost, vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE)
            }
            MemoryClass::Readback => {
                (vk_mem::MemoryUsage::AutoPreferHost, vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM)
            }
            MemoryClass::DeviceLocal | MemoryClass::Shared => {
                (vk_mem::MemoryUsage::AutoPreferDevice, vk_mem::AllocationCreateFlags::empty())
            }
        };
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage,
            flags,
            ..Default::default()
        };

        let (handle, mut allocation) =
            unsafe { self.allocator.create_buffer_with_alignment(&buffer_ci, &alloc_ci, self.scratch_alignment)? };

        let mut mapped_ptr = None;
        if desc.memory.is_host_visible() {
            match unsafe { self.allocator.map_memory(&mut allocation) } {
                Ok(ptr) => mapped_ptr = Some(ptr),
                Err(e) => {
                    unsafe { self.allocator.destroy_buffer(handle, &mut allocation) };
                    return Err(e.into());
                }
            }
        }

        Ok(VulkanBuffer {
            handle,
            memory: VulkanMemory::Vma(allocation),
            desc: desc.clone(),
            mapped_ptr,
            address: self.query_address(handle, &buffer_ci),
        })
    }

    /// 跨 API 共享的 buffer，需要独立的可导出分配
    #[cfg(unix)]
    fn create_exportable_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<VulkanBuffer> {
        let handle_type = vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD;

        let mut external_ci = vk::ExternalMemoryBufferCreateInfo::default().handle_types(handle_type);
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(convert::buffer_usage(desc.usage))
            .push_next(&mut external_ci);
        let handle = unsafe { self.device.create_buffer(&buffer_ci, None)? };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        let memory_type_index = (0..self.memory_properties.memory_type_count).find(|&idx| {
            requirements.memory_type_bits & (1 << idx) != 0
                && self.memory_properties.memory_types[idx as usize]
                    .property_flags
                    .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
        });
        let Some(memory_type_index) = memory_type_index else {
            unsafe { self.device.destroy_buffer(handle, None) };
            return Err(GfxError::Unsupported("no device local memory type for exportable buffer".to_string()));
        };

        let mut export_ci = vk::ExportMemoryAllocateInfo::default().handle_types(handle_type);
        let mut flags_ci = vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut export_ci)
            .push_next(&mut flags_ci);

        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(e.into());
            }
        };
        if let Err(e) = unsafe { self.device.bind_buffer_memory(handle, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(handle, None);
                self.device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        Ok(VulkanBuffer {
            handle,
            memory: VulkanMemory::Exportable(memory),
            desc: desc.clone(),
            mapped_ptr: None,
            address: self.query_address(handle, &buffer_ci),
        })
    }

    #[cfg(not(unix))]
    fn create_exportable_buffer(&self, _desc: &GfxBufferDesc) -> GfxResult<VulkanBuffer> {
        Err(GfxError::Unsupported("exportable buffers require VK_KHR_external_memory_fd".to_string()))
    }

    fn query_address(&self, handle: vk::Buffer, buffer_ci: &vk::BufferCreateInfo) -> Option<vk::DeviceAddress> {
        buffer_ci.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| unsafe {
            self.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(handle))
        })
    }

    fn required_address(&self, buffer: GfxBufferHandle) -> GfxResult<vk::DeviceAddress> {
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(buffer).ok_or(GfxError::InvalidHandle)?;
        buffer
            .address
            .ok_or_else(|| GfxError::InvalidArgument(format!("buffer `{}` has no device address", buffer.desc.name)))
    }
}

// acceleration structure & commands
impl VulkanDevice {
    fn prepare_geometry(&self, inputs: &AccelerationBuildInputs) -> GfxResult<PreparedGeometry> {
        let geometry = match inputs.payload {
            AccelerationBuildPayload::BottomLevel(GeometryDesc::Aabbs(aabbs)) => {
                let address = self.required_address(aabbs.buffer)? + aabbs.offset;
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                            .data(vk::DeviceOrHostAddressConstKHR { device_address: address })
                            .stride(aabbs.stride),
                    })
                    .flags(convert::geometry_flags(aabbs.flags))
            }
            AccelerationBuildPayload::BottomLevel(GeometryDesc::Triangles(triangles)) => {
                if triangles.vertex_stride < TRIANGLE_VERTEX_SIZE {
                    return Err(GfxError::PrebuildQuery(format!("invalid vertex stride {}", triangles.vertex_stride)));
                }
                let vertex_address = self.required_address(triangles.vertex_buffer)?;
                let index_address = self.required_address(triangles.index_buffer)?;
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                            .vertex_format(vk::Format::R32G32B32_SFLOAT)
                            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                                device_address: vertex_address,
                            })
                            .vertex_stride(triangles.vertex_stride)
                            .max_vertex(triangles.vertex_count.saturating_sub(1))
                            .index_type(vk::IndexType::UINT32)
                            .index_data(vk::DeviceOrHostAddressConstKHR {
                                device_address: index_address,
                            }),
                    })
                    .flags(convert::geometry_flags(triangles.flags))
            }
            AccelerationBuildPayload::TopLevel { instance_buffer, .. } => {
                let address = self.required_address(instance_buffer)?;
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                            .array_of_pointers(false)
                            .data(vk::DeviceOrHostAddressConstKHR { device_address: address }),
                    })
            }
        };

        Ok(PreparedGeometry {
            ty: convert::acceleration_type(inputs.kind()),
            flags: convert::build_flags(inputs.flags),
            geometry,
            primitive_count: inputs.primitive_count(),
        })
    }

    /// 先把所有 handle 解析成 vk 对象，失败时不会留下录制了一半的 command buffer
    fn prepare_commands(&self, recorder: &GfxCommandRecorder) -> GfxResult<Vec<PreparedCommand>> {
        recorder
            .commands()
            .iter()
            .map(|command| -> GfxResult<PreparedCommand> {
                Ok(match command {
                    GfxCommand::CopyBuffer { src, dst, region } => PreparedCommand::Copy {
                        src: self.vk_buffer(*src)?,
                        dst: self.vk_buffer(*dst)?,
                        region: vk::BufferCopy {
                            src_offset: region.src_offset,
                            dst_offset: region.dst_offset,
                            size: region.size,
                        },
                    },
                    GfxCommand::Transition { buffer, before, after } => {
                        let (src_stage, src_access) = convert::state_mask(*before);
                        let (dst_stage, dst_access) = convert::state_mask(*after);
                        PreparedCommand::Barrier(
                            vk::BufferMemoryBarrier2::default()
                                .src_stage_mask(src_stage)
                                .src_access_mask(src_access)
                                .dst_stage_mask(dst_stage)
                                .dst_access_mask(dst_access)
                                .buffer(self.vk_buffer(*buffer)?)
                                .offset(0)
                                .size(vk::WHOLE_SIZE),
                        )
                    }
                    GfxCommand::BuildAcceleration { inputs, dst, scratch } => PreparedCommand::Build {
                        geometry: self.prepare_geometry(inputs)?,
                        dst: self.vk_acceleration_structure(*dst)?,
                        scratch_address: self.required_address(*scratch)?,
                    },
                })
            })
            .collect()
    }

    fn record(&self, commands: &[PreparedCommand]) -> GfxResult<()> {
        let cmd = self.command_buffer;
        unsafe {
            self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;

            for command in commands {
                match command {
                    PreparedCommand::Copy { src, dst, region } => {
                        self.device.cmd_copy_buffer(cmd, *src, *dst, std::slice::from_ref(region));
                    }
                    PreparedCommand::Barrier(barrier) => {
                        let dependency_info =
                            vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(barrier));
                        self.device.cmd_pipeline_barrier2(cmd, &dependency_info);
                    }
                    PreparedCommand::Build {
                        geometry,
                        dst,
                        scratch_address,
                    } => {
                        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                            .ty(geometry.ty)
                            .flags(geometry.flags)
                            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                            .geometries(std::slice::from_ref(&geometry.geometry))
                            .dst_acceleration_structure(*dst)
                            .scratch_data(vk::DeviceOrHostAddressKHR {
                                device_address: *scratch_address,
                            });
                        let range =
                            vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(geometry.primitive_count);
                        self.acceleration_structure.cmd_build_acceleration_structures(
                            cmd,
                            std::slice::from_ref(&build_info),
                            &[std::slice::from_ref(&range)],
                        );

                        // 后续的构建（例如 tlas）以及 shader 都需要读取这次的结果
                        let barrier = vk::MemoryBarrier2::default()
                            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
                            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
                            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_access_mask(
                                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::SHADER_READ,
                            );
                        self.device.cmd_pipeline_barrier2(
                            cmd,
                            &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier)),
                        );
                    }
                }
            }

            self.device.end_command_buffer(cmd)?;
        }
        Ok(())
    }
}

fn submission_error(name: &str, result: vk::Result) -> GfxError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GfxError::DeviceLost,
        other => GfxError::Submission {
            name: name.to_string(),
            reason: other.to_string(),
        },
    }
}

impl GfxDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn current_frame_index(&self) -> usize {
        self.frame_index.get()
    }

    fn advance_frame(&self) {
        self.frame_index.set((self.frame_index.get() + 1) % self.frames_in_flight);
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBufferHandle> {
        let buffer = match desc.memory {
            MemoryClass::Shared => self.create_exportable_buffer(desc),
            _ => self.create_vma_buffer(desc),
        }
        .map_err(|e| GfxError::BufferCreation {
            name: desc.name.clone(),
            size: desc.size,
            reason: e.to_string(),
        })?;

        log::debug!("vulkan: create buffer `{}` ({} bytes, {:?})", desc.name, desc.size, desc.memory);
        Ok(self.buffers.borrow_mut().insert(buffer))
    }

    fn destroy_buffer(&self, buffer: GfxBufferHandle) {
        let removed = self.buffers.borrow_mut().remove(buffer);
        match removed {
            Some(buffer) => self.release_buffer(buffer),
            None => log::warn!("vulkan: destroy of released buffer {buffer:?}"),
        }
    }

    fn buffer_size(&self, buffer: GfxBufferHandle) -> GfxResult<u64> {
        self.buffers.borrow().get(buffer).map(|b| b.desc.size).ok_or(GfxError::InvalidHandle)
    }

    fn buffer_device_address(&self, buffer: GfxBufferHandle) -> GfxResult<u64> {
        self.required_address(buffer)
    }

    fn write_mapped(&self, buffer: GfxBufferHandle, offset: u64, data: &[u8]) -> GfxResult<()> {
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(buffer).ok_or(GfxError::InvalidHandle)?;
        let ptr = buffer
            .mapped_ptr
            .ok_or_else(|| GfxError::Map(format!("buffer `{}` is not host visible", buffer.desc.name)))?;
        check_range(offset, data.len() as u64, buffer.desc.size)?;

        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len()) };
        if let VulkanMemory::Vma(allocation) = &buffer.memory {
            self.allocator.flush_allocation(allocation, offset, data.len() as vk::DeviceSize)?;
        }
        Ok(())
    }

    fn read_mapped(&self, buffer: GfxBufferHandle, offset: u64, out: &mut [u8]) -> GfxResult<()> {
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(buffer).ok_or(GfxError::InvalidHandle)?;
        let ptr = buffer
            .mapped_ptr
            .ok_or_else(|| GfxError::Map(format!("buffer `{}` is not host visible", buffer.desc.name)))?;
        check_range(offset, out.len() as u64, buffer.desc.size)?;

        if let VulkanMemory::Vma(allocation) = &buffer.memory {
            self.allocator.invalidate_allocation(allocation, offset, out.len() as vk::DeviceSize)?;
        }
        unsafe { std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn query_prebuild_sizes(&self, inputs: &AccelerationBuildInputs) -> GfxResult<PrebuildSizes> {
        let prepared = self.prepare_geometry(inputs).map_err(GfxError::into_query_error)?;
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(prepared.ty)
            .flags(prepared.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&prepared.geometry));

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[prepared.primitive_count],
                &mut size_info,
            );
        }

        Ok(PrebuildSizes {
            result_size: size_info.acceleration_structure_size,
            scratch_size: size_info.build_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationKind,
        result_buffer: GfxBufferHandle,
        size: u64,
        name: &str,
    ) -> GfxResult<GfxAccelerationHandle> {
        let creation_error = |reason: String| GfxError::AccelerationCreation {
            name: name.to_string(),
            reason,
        };

        let buffer = {
            let buffers = self.buffers.borrow();
            let buffer = buffers.get(result_buffer).ok_or_else(|| creation_error("result buffer released".into()))?;
            if buffer.desc.size < size {
                return Err(creation_error(format!("result buffer {} < {size}", buffer.desc.size)));
            }
            buffer.handle
        };

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .ty(convert::acceleration_type(kind))
            .size(size)
            .buffer(buffer);
        let acceleration = unsafe { self.acceleration_structure.create_acceleration_structure(&create_info, None) }
            .map_err(|e| creation_error(e.to_string()))?;

        Ok(self.accelerations.borrow_mut().insert(acceleration))
    }

    fn destroy_acceleration_structure(&self, acceleration: GfxAccelerationHandle) {
        let removed = self.accelerations.borrow_mut().remove(acceleration);
        match removed {
            Some(acceleration) => unsafe {
                self.acceleration_structure.destroy_acceleration_structure(acceleration, None);
            },
            None => log::warn!("vulkan: destroy of released acceleration structure {acceleration:?}"),
        }
    }

    fn acceleration_structure_address(&self, acceleration: GfxAccelerationHandle) -> GfxResult<u64> {
        let acceleration = self.vk_acceleration_structure(acceleration)?;
        Ok(unsafe {
            self.acceleration_structure.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(acceleration),
            )
        })
    }

    fn shader_table_limits(&self) -> ShaderTableLimits {
        self.limits
    }

    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc) -> GfxResult<Box<dyn GfxRayTracingPipeline>> {
        Ok(Box::new(VulkanRayTracingPipeline::new(self, desc)?))
    }

    fn submit_and_wait(&self, recorder: &GfxCommandRecorder) -> GfxResult<()> {
        let commands = self.prepare_commands(recorder)?;
        self.record(&commands).map_err(|e| GfxError::Submission {
            name: recorder.name().to_string(),
            reason: e.to_string(),
        })?;

        log::debug!("vulkan: submit `{}` with {} commands", recorder.name(), commands.len());
        let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(self.command_buffer);
        let submit_info = vk::SubmitInfo2::default().command_buffer_infos(std::slice::from_ref(&cmd_info));
        unsafe {
            self.device
                .queue_submit2(self.queue, std::slice::from_ref(&submit_info), self.fence)
                .map_err(|e| submission_error(recorder.name(), e))?;
            self.device
                .wait_for_fences(std::slice::from_ref(&self.fence), true, u64::MAX)
                .map_err(|e| submission_error(recorder.name(), e))?;
            self.device.reset_fences(std::slice::from_ref(&self.fence))?;
        }
        Ok(())
    }

    fn wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| submission_error("wait-idle", e))
    }

    #[cfg(unix)]
    fn export_memory_handle(&self, buffer: GfxBufferHandle) -> GfxResult<ExternalMemoryHandle> {
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(buffer).ok_or(GfxError::InvalidHandle)?;
        let VulkanMemory::Exportable(memory) = buffer.memory else {
            return Err(GfxError::Interop {
                reason: format!("buffer `{}` is not shareable", buffer.desc.name),
                diagnostic: Some(format!("memory class is {:?}", buffer.desc.memory)),
            });
        };

        let fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
        let fd = unsafe { self.external_memory_fd.get_memory_fd(&fd_info) }.map_err(|e| GfxError::Interop {
            reason: "vkGetMemoryFdKHR failed".to_string(),
            diagnostic: Some(e.to_string()),
        })?;

        Ok(ExternalMemoryHandle {
            kind: crate::device::ExternalHandleKind::OpaqueFd(fd),
            size: buffer.desc.size,
        })
    }

    #[cfg(not(unix))]
    fn export_memory_handle(&self, _buffer: GfxBufferHandle) -> GfxResult<ExternalMemoryHandle> {
        Err(GfxError::Unsupported("memory export requires VK_KHR_external_memory_fd".to_string()))
    }
}
