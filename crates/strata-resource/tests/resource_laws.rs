use std::rc::Rc;

use strata_gfx::commands::recorder::GfxCommandRecorder;
use strata_gfx::device::GfxDevice;
use strata_gfx::error::FailedStep;
use strata_gfx::host::device::HostDevice;
use strata_gfx::host::importer::HostExternalImporter;
use strata_gfx::host::pipeline::HostRayTracingPipeline;
use strata_gfx::raytracing::geometry::{AABB_SIZE, AabbGeometry, GeometryDesc, GeometryFlags};
use strata_gfx::raytracing::pipeline::{GfxRayTracingPipeline, HitGroupKind, ShaderCategory, export_name};
use strata_resource::acceleration::TlasInstance;
use strata_resource::buffer::{BufferType, GpuBuffer};
use strata_resource::render_core::RenderCore;
use strata_resource::shader_table::align_up;
use strata_resource::transient_pool::TransientPurpose;

fn setup(frames_in_flight: usize) -> (Rc<HostDevice>, Rc<RenderCore>) {
    strata_crate_tools::init_log::init_log();
    let device = Rc::new(HostDevice::with_frames_in_flight(frames_in_flight));
    let core = RenderCore::new(device.clone());
    (device, core)
}

/// 三种形态各一个
fn all_variants(core: &Rc<RenderCore>, size: u64) -> Vec<Box<dyn GpuBuffer>> {
    let importer = Rc::new(HostExternalImporter::new());
    vec![
        core.create_static_buffer(size, "static").unwrap(),
        core.create_dynamic_buffer(size, "dynamic").unwrap(),
        Box::new(core.create_interop_buffer(size, importer, "interop").unwrap()),
    ]
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn upload_download_round_trip_for_every_variant() {
    let (_device, core) = setup(3);
    for mut buffer in all_variants(&core, 300) {
        for (len, offset) in [(1, 0), (16, 0), (64, 236), (300, 0), (7, 293), (0, 300)] {
            let data = pattern(len, offset as u8);
            buffer.upload_data(&data, offset).unwrap();

            let mut out = vec![0u8; len];
            buffer.download_data(&mut out, offset).unwrap();
            assert_eq!(out, data, "{:?} len {} offset {}", buffer.buffer_type(), len, offset);
        }
    }
}

#[test]
fn out_of_range_is_rejected_for_every_variant() {
    let (_device, core) = setup(2);
    for mut buffer in all_variants(&core, 32) {
        assert!(buffer.upload_data(&[0; 8], 30).is_err());
        let mut out = [0u8; 33];
        assert!(buffer.download_data(&mut out, 0).is_err());
    }
}

#[test]
fn resize_preserves_prefix_for_every_variant() {
    let (_device, core) = setup(2);
    for mut buffer in all_variants(&core, 128) {
        let before = pattern(128, 7);
        buffer.upload_data(&before, 0).unwrap();

        let mut old_size = 128;
        for new_size in [200u64, 50, 50, 1, 90, 0, 12] {
            buffer.resize(new_size).unwrap();
            assert_eq!(buffer.size(), new_size);

            let keep = old_size.min(new_size) as usize;
            let mut out = vec![0u8; keep];
            buffer.download_data(&mut out, 0).unwrap();
            assert_eq!(out, before[..keep], "{:?} {} -> {}", buffer.buffer_type(), old_size, new_size);
            old_size = new_size;
        }
    }
}

#[test]
fn variants_report_their_type() {
    let (_device, core) = setup(2);
    let types = all_variants(&core, 8).iter().map(|b| b.buffer_type()).collect::<Vec<_>>();
    assert_eq!(types, [BufferType::Static, BufferType::Dynamic, BufferType::Interop]);
}

#[test]
fn dynamic_upload_needs_no_gpu_round_trip() {
    let (device, core) = setup(3);
    let mut buffer = core.create_dynamic_buffer(64, "per-frame").unwrap();
    let before = device.stats();

    for frame in 0..6u8 {
        buffer.upload_data(&[frame; 64], 0).unwrap();
        let mut out = [0u8; 64];
        buffer.download_data(&mut out, 0).unwrap();
        assert_eq!(out, [frame; 64]);
    }

    let after = device.stats();
    assert_eq!(after.submissions, before.submissions);
    assert_eq!(after.wait_idle_calls, before.wait_idle_calls);
}

#[test]
fn dynamic_transfer_is_idempotent() {
    let (device, core) = setup(2);
    let mut buffer = core.create_dynamic_buffer(32, "per-frame").unwrap();
    buffer.upload_data(&pattern(32, 1), 0).unwrap();

    let mut contents = Vec::new();
    for _ in 0..2 {
        let mut cmd = GfxCommandRecorder::new("frame");
        buffer.transfer_data(&mut cmd).unwrap();
        device.submit_and_wait(&cmd).unwrap();
        contents.push(device.read_device_memory(buffer.buffer()).unwrap());
    }
    assert_eq!(contents[0], contents[1]);
    assert_eq!(contents[0], pattern(32, 1));
}

#[test]
fn dynamic_frames_rotate_with_device() {
    let (device, core) = setup(3);
    let mut buffer = core.create_dynamic_buffer(4, "per-frame").unwrap();
    let mut frame_buffers = Vec::new();

    for frame in 0..3u8 {
        buffer.upload_data(&[frame; 4], 0).unwrap();
        let mut cmd = GfxCommandRecorder::new("frame");
        buffer.transfer_data(&mut cmd).unwrap();
        device.submit_and_wait(&cmd).unwrap();
        frame_buffers.push(buffer.buffer());
        device.advance_frame();
    }

    // 回到第 0 帧
    assert_eq!(buffer.buffer(), frame_buffers[0]);
    for (frame, handle) in frame_buffers.iter().enumerate() {
        assert_eq!(device.read_device_memory(*handle).unwrap(), vec![frame as u8; 4]);
    }
}

#[test]
fn shader_table_offsets_and_identifiers() {
    let (device, core) = setup(2);
    let pipeline = HostRayTracingPipeline::new(32, 2, vec![HitGroupKind::Triangles], 0);
    let table = core.create_shader_table(&pipeline, &[0, 1], &[0], &[], "sbt").unwrap();

    let limits = device.shader_table_limits();
    let r = align_up(limits.identifier_size as u64, limits.record_alignment as u64);
    let a = limits.table_alignment as u64;

    assert_eq!(table.raygen_offset(), 0);
    assert_eq!(table.miss_offset(), align_up(r, a));
    assert_eq!(table.hit_group_offset(), align_up(table.miss_offset() + 2 * r, a));
    assert_eq!(table.callable_offset(), align_up(table.hit_group_offset() + r, a));

    let data = device.read_device_memory(table.buffer()).unwrap();
    let expected = [
        (ShaderCategory::RayGen, 0, table.raygen_offset()),
        (ShaderCategory::Miss, 0, table.miss_offset()),
        (ShaderCategory::Miss, 1, table.miss_offset() + r),
        (ShaderCategory::HitGroup, 0, table.hit_group_offset()),
    ];
    for (category, index, offset) in expected {
        let identifier = pipeline.shader_identifier(&export_name(category, index)).unwrap();
        let offset = offset as usize;
        assert_eq!(data[offset..offset + identifier.len()], identifier[..], "{category:?} {index}");
    }
}

#[test]
fn degenerate_blas_never_crashes() {
    let (_device, core) = setup(2);
    let buffer = core.create_static_buffer(AABB_SIZE, "aabbs").unwrap();
    let geometry = GeometryDesc::Aabbs(AabbGeometry {
        buffer: buffer.buffer(),
        offset: 0,
        stride: AABB_SIZE,
        count: 0,
        flags: GeometryFlags::OPAQUE,
    });

    match core.build_blas(&geometry, "degenerate") {
        Ok(blas) => assert_eq!(blas.primitive_count(), 0),
        Err(e) => assert!(matches!(e.step(), FailedStep::Query | FailedStep::Allocation)),
    }

    // 非法的 stride 必须在查询阶段失败
    let bad = GeometryDesc::Aabbs(AabbGeometry {
        stride: 4,
        count: 1,
        ..match geometry {
            GeometryDesc::Aabbs(aabbs) => aabbs,
            GeometryDesc::Triangles(_) => unreachable!(),
        }
    });
    let err = core.build_blas(&bad, "bad-stride").err().unwrap();
    assert_eq!(err.step(), FailedStep::Query);
}

#[test]
fn tlas_instance_ids_are_positions() {
    let (device, core) = setup(2);
    let mut aabbs = core.create_static_buffer(AABB_SIZE, "aabbs").unwrap();
    aabbs.upload_data(bytemuck::cast_slice(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0]), 0).unwrap();
    let blas = core
        .build_blas(
            &GeometryDesc::Aabbs(AabbGeometry {
                buffer: aabbs.buffer(),
                offset: 0,
                stride: AABB_SIZE,
                count: 1,
                flags: GeometryFlags::OPAQUE,
            }),
            "blas",
        )
        .unwrap();

    for count in [1usize, 5, 17] {
        let instances = (0..count)
            .map(|i| TlasInstance::new(&blas, glam::Mat4::from_translation(glam::vec3(i as f32, 0.0, 0.0))))
            .collect::<Vec<_>>();
        let tlas = core.build_tlas(&instances, "tlas").unwrap();

        assert_eq!(tlas.instance_count() as usize, count);
        let records = device.acceleration_info(tlas.handle()).unwrap().instances;
        assert_eq!(records.len(), count);
        for (idx, record) in records.iter().enumerate() {
            assert_eq!(record.instance_id() as usize, idx);
            assert_eq!(record.transform[3], idx as f32);
        }
    }
}

#[test]
fn transient_capacity_is_monotonic() {
    let (device, core) = setup(2);
    let mut last = [0u64; 4];
    for size in [1000u64, 10, 4000, 3999, 0, 4000, 12000, 1] {
        for (slot, purpose) in TransientPurpose::ALL.into_iter().enumerate() {
            let created = device.stats().buffers_created;
            core.transient_buffer(purpose, size).unwrap();
            let capacity = core.transient_capacity(purpose);

            assert!(capacity >= size);
            assert!(capacity >= last[slot]);
            if size <= last[slot] {
                assert_eq!(device.stats().buffers_created, created, "{purpose:?} {size}");
            }
            last[slot] = capacity;
        }
    }
}

#[test]
fn dropping_everything_releases_all_device_objects() {
    let (device, core) = setup(2);
    {
        let mut buffers = all_variants(&core, 64);
        for buffer in buffers.iter_mut() {
            buffer.upload_data(&[1; 64], 0).unwrap();
        }
        let blas = core
            .build_blas(
                &GeometryDesc::Aabbs(AabbGeometry {
                    buffer: buffers[0].buffer(),
                    offset: 0,
                    stride: AABB_SIZE,
                    count: 2,
                    flags: GeometryFlags::empty(),
                }),
                "blas",
            )
            .unwrap();
        let _tlas = core.build_tlas(&[TlasInstance::new(&blas, glam::Mat4::IDENTITY)], "tlas").unwrap();
        let pipeline = HostRayTracingPipeline::new(32, 1, vec![HitGroupKind::Procedural], 1);
        let _table = core.create_shader_table(&pipeline, &[0], &[0], &[0], "sbt").unwrap();
    }
    assert_eq!(device.live_acceleration_count(), 0);

    drop(core);
    assert_eq!(device.live_buffer_count(), 0);
    let stats = device.stats();
    assert_eq!(stats.buffers_created, stats.buffers_destroyed);
    assert_eq!(stats.live_bytes, 0);
}
