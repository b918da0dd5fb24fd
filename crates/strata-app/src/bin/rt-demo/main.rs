use std::path::PathBuf;
use std::rc::Rc;

use strata_app::app::StrataApp;
use strata_app::outer_app::OuterApp;
use strata_gfx::commands::recorder::GfxCommandRecorder;
use strata_gfx::error::GfxError;
use strata_gfx::frame_counter::FrameCounter;
use strata_gfx::host::importer::HostExternalImporter;
use strata_gfx::raytracing::geometry::{AABB_SIZE, GeometryFlags, TRIANGLE_VERTEX_SIZE};
use strata_gfx::raytracing::pipeline::{HitGroupKind, RayTracingPipelineDesc, ShaderCategory};
use strata_resource::acceleration::{GfxAcceleration, TlasInstance};
use strata_resource::buffer::GpuBuffer;
use strata_resource::buffer::interop_buffer::InteropBuffer;
use strata_resource::render_core::RenderCore;
use strata_resource::shader_table::GfxShaderTable;

/// 存放 `{入口名}.spv` 的目录，Vulkan 后端创建管线时需要
const SHADER_DIR_ENV: &str = "STRATA_RT_SHADER_DIR";

/// 每帧更新的相机数据
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CameraData {
    view_proj: glam::Mat4,
    frame_id: u32,
    _padding: [u32; 3],
}

/// 一个三角形 + 一个程序化的盒子，放在同一个 TLAS 里
struct RtDemo {
    _vertex_buffer: Box<dyn GpuBuffer>,
    _index_buffer: Box<dyn GpuBuffer>,
    _aabb_buffer: Box<dyn GpuBuffer>,
    camera_buffer: Box<dyn GpuBuffer>,
    /// 当前后端导出的句柄无法被导入时为 None
    accum_buffer: Option<InteropBuffer>,

    triangle_blas: GfxAcceleration,
    box_blas: GfxAcceleration,
    tlas: GfxAcceleration,
    shader_table: GfxShaderTable,
}

impl RtDemo {
    fn create_geometry(core: &Rc<RenderCore>) -> anyhow::Result<[Box<dyn GpuBuffer>; 3]> {
        let vertices: [f32; 9] = [-0.5, -0.5, 0.0, 0.5, -0.5, 0.0, 0.0, 0.5, 0.0];
        let indices: [u32; 3] = [0, 1, 2];
        let aabb: [f32; 6] = [1.0, -0.5, -0.5, 2.0, 0.5, 0.5];

        let mut vertex_buffer = core.create_static_buffer(size_of_val(&vertices) as u64, "triangle-vertices")?;
        vertex_buffer.upload_data(bytemuck::cast_slice(&vertices), 0)?;
        let mut index_buffer = core.create_static_buffer(size_of_val(&indices) as u64, "triangle-indices")?;
        index_buffer.upload_data(bytemuck::cast_slice(&indices), 0)?;
        let mut aabb_buffer = core.create_static_buffer(AABB_SIZE, "box-aabb")?;
        aabb_buffer.upload_data(bytemuck::cast_slice(&aabb), 0)?;

        Ok([vertex_buffer, index_buffer, aabb_buffer])
    }

    fn rebuild_tlas(&mut self, core: &RenderCore, frame: &FrameCounter) -> anyhow::Result<()> {
        let angle = frame.frame_id() as f32 * 0.1;
        let instances = [
            TlasInstance::new(&self.triangle_blas, glam::Mat4::from_rotation_y(angle)),
            TlasInstance::new(&self.box_blas, glam::Mat4::IDENTITY).with_hit_group_offset(1),
        ];
        self.tlas = core.build_tlas(&instances, "scene-tlas")?;
        Ok(())
    }
}

impl OuterApp for RtDemo {
    fn init(core: &Rc<RenderCore>) -> anyhow::Result<Self> {
        let [vertex_buffer, index_buffer, aabb_buffer] = Self::create_geometry(core)?;

        let triangle_blas = GfxAcceleration::build_triangle_blas_sync(
            core,
            vertex_buffer.as_ref(),
            TRIANGLE_VERTEX_SIZE,
            index_buffer.as_ref(),
            "triangle-blas",
        )?;
        let box_blas =
            GfxAcceleration::build_aabb_blas_sync(core, aabb_buffer.as_ref(), AABB_SIZE, GeometryFlags::OPAQUE, "box-blas")?;
        let tlas = GfxAcceleration::build_tlas_from_objects(
            core,
            &[(&triangle_blas, glam::Mat4::IDENTITY), (&box_blas, glam::Mat4::IDENTITY)],
            "scene-tlas",
        )?;

        let pipeline = core.device().create_ray_tracing_pipeline(&RayTracingPipelineDesc {
            name: "rt-demo".to_string(),
            miss_count: 2,
            hit_groups: vec![HitGroupKind::Triangles, HitGroupKind::Procedural],
            callable_count: 1,
            shader_dir: std::env::var_os(SHADER_DIR_ENV).map(PathBuf::from),
        })?;
        let shader_table = core.create_shader_table(pipeline.as_ref(), &[0, 1], &[0, 1], &[0], "rt-demo")?;
        for category in [ShaderCategory::RayGen, ShaderCategory::Miss, ShaderCategory::HitGroup, ShaderCategory::Callable] {
            let region = shader_table.region(category)?;
            log::info!("{:?} region: {:#x} stride {} size {}", category, region.address, region.stride, region.size);
        }

        let camera_buffer = core.create_dynamic_buffer(size_of::<CameraData>() as u64, "camera")?;
        let accum_buffer = match core.create_interop_buffer(
            4 * size_of::<f32>() as u64 * 64 * 64,
            Rc::new(HostExternalImporter::new()),
            "accum",
        ) {
            Ok(buffer) => {
                log::info!("accum buffer shared at {:#x}", buffer.external_pointer()?);
                Some(buffer)
            }
            Err(e @ GfxError::Interop { .. }) => {
                log::warn!("accum buffer not shared on `{}`: {e}", core.device().name());
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            _vertex_buffer: vertex_buffer,
            _index_buffer: index_buffer,
            _aabb_buffer: aabb_buffer,
            camera_buffer,
            accum_buffer,
            triangle_blas,
            box_blas,
            tlas,
            shader_table,
        })
    }

    fn update(&mut self, core: &Rc<RenderCore>, frame: &FrameCounter) -> anyhow::Result<()> {
        let camera = CameraData {
            view_proj: glam::Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0)
                * glam::Mat4::look_at_rh(glam::vec3(0.0, 0.0, 3.0), glam::Vec3::ZERO, glam::Vec3::Y),
            frame_id: frame.frame_id() as u32,
            _padding: [0; 3],
        };
        self.camera_buffer.upload_data(bytemuck::bytes_of(&camera), 0)?;

        if frame.frame_id() % 3 == 2 {
            self.rebuild_tlas(core, frame)?;
            log::info!("{} rebuilt tlas with {} instances", frame.frame_name(), self.tlas.instance_count());
        }
        if let Some(accum_buffer) = self.accum_buffer.as_mut().filter(|_| frame.frame_id() == 4) {
            // 窗口大小变化时累积 buffer 需要跟着变化
            accum_buffer.resize(4 * size_of::<f32>() as u64 * 128 * 128)?;
            log::info!("accum buffer re-shared at {:#x}", accum_buffer.external_pointer()?);
        }
        Ok(())
    }

    fn record(&mut self, cmd: &mut GfxCommandRecorder) -> anyhow::Result<()> {
        self.camera_buffer.transfer_data(cmd)?;
        Ok(())
    }

    fn shutdown(&mut self, _core: &Rc<RenderCore>) {
        log::info!(
            "shutdown: tlas {} bytes, shader table {} bytes",
            self.tlas.size(),
            self.shader_table.layout().total_size
        );
    }
}

fn main() -> anyhow::Result<()> {
    StrataApp::<RtDemo>::run()
}
