mod common;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use common::{discrete, rig};
use vk_dispatch::{kind, Buffer, Error, Program, ProgramState, SimConfig, SimDriver, Uniform};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SaxpyParams {
    size: u32,
    a: f32,
}

/// y[i] += a * x[i] for every invocation below `size`
fn saxpy_kernel(sim: &SimDriver) -> Vec<u32> {
    sim.register_kernel(|inv| {
        let params: SaxpyParams = inv.push_constants().unwrap();
        let workgroup = inv.spec_constant::<u32>(0).unwrap_or(1);
        let invocations = (inv.groups()[0] * workgroup).min(params.size) as usize;

        let mut y: Vec<f32> = inv.read(0);
        let x: Vec<f32> = inv.read(1);
        for i in 0..invocations.min(y.len()).min(x.len()) {
            y[i] += params.a * x[i];
        }
        inv.write(0, &y);
    })
}

/// data[i] *= scale[0]
fn scale_kernel(sim: &SimDriver) -> Vec<u32> {
    sim.register_kernel(|inv| {
        let scale = inv.read::<f32>(1).first().copied().unwrap_or(1.0);
        let data: Vec<f32> = inv.read::<f32>(0).into_iter().map(|v| v * scale).collect();
        inv.write(0, &data);
    })
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Add {
    v: f32,
}

/// data[i] += v
fn add_kernel(sim: &SimDriver) -> Vec<u32> {
    sim.register_kernel(|inv| {
        let Add { v } = inv.push_constants().unwrap();
        let data: Vec<f32> = inv.read::<f32>(0).into_iter().map(|x| x + v).collect();
        inv.write(0, &data);
    })
}

#[test]
fn saxpy_matches_host_computation() {
    let rig = discrete();
    let n = 128;
    let a = 0.1f32;
    let x_host: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let y_host: Vec<f32> = (0..n).map(|i| (2 * i) as f32).collect();

    let y = Buffer::<f32>::from_slice(&rig.device, &y_host).unwrap();
    let x = Buffer::<f32>::from_slice(&rig.device, &x_host).unwrap();

    let mut program = Program::<SaxpyParams>::new(&rig.device, &saxpy_kernel(&rig.sim)).unwrap();
    assert_eq!(program.state(), ProgramState::Unbound);
    program
        .grid(2, 1, 1)
        .spec((64u32,))
        .call(&SaxpyParams { size: n as u32, a }, &[&y, &x])
        .unwrap();

    let result = y.to_vec().unwrap();
    for i in 0..n {
        let expected = y_host[i] + a * x_host[i];
        assert!(
            (result[i] - expected).abs() <= 1e-5 * expected.abs().max(1.0),
            "element {i}: {} != {expected}",
            result[i]
        );
    }
}

#[test]
fn saxpy_of_constants_gives_one_point_two() {
    let rig = discrete();
    let y = Buffer::<f32>::with_value(&rig.device, 128, 1.0).unwrap();
    let x = Buffer::<f32>::with_value(&rig.device, 128, 2.0).unwrap();

    let mut program = Program::<SaxpyParams>::new(&rig.device, &saxpy_kernel(&rig.sim)).unwrap();
    program
        .grid(2, 1, 1)
        .spec((64u32,))
        .call(&SaxpyParams { size: 128, a: 0.1 }, &[&y, &x])
        .unwrap();

    for v in y.to_vec().unwrap() {
        assert!((v - 1.2).abs() < 1e-5, "{v}");
    }
}

#[test]
fn grid_limits_the_work_done() {
    let rig = discrete();
    let y = Buffer::<f32, kind::Host>::with_value(&rig.device, 8, 1.0).unwrap();
    let x = Buffer::<f32, kind::Host>::with_value(&rig.device, 8, 1.0).unwrap();

    let mut program = Program::<SaxpyParams>::new(&rig.device, &saxpy_kernel(&rig.sim)).unwrap();
    program
        .grid(1, 1, 1)
        .spec((4u32,))
        .call(&SaxpyParams { size: 8, a: 1.0 }, &[&y, &x])
        .unwrap();

    assert_eq!(y.to_vec().unwrap(), vec![2.0, 2.0, 2.0, 2.0, 1.0, 1.0, 1.0, 1.0]);
}

#[test]
fn pipeline_is_reused_until_specialization_changes() {
    let rig = discrete();
    let y = Buffer::<f32, kind::Host>::with_value(&rig.device, 64, 0.0).unwrap();
    let x = Buffer::<f32, kind::Host>::with_value(&rig.device, 64, 1.0).unwrap();
    let params = SaxpyParams { size: 64, a: 1.0 };

    let mut program = Program::<SaxpyParams>::new(&rig.device, &saxpy_kernel(&rig.sim)).unwrap();
    program.grid(1, 1, 1).spec((64u32,));
    program.call(&params, &[&y, &x]).unwrap();
    program.call(&params, &[&y, &x]).unwrap();
    program.run().unwrap();

    let stats = rig.sim.stats();
    assert_eq!(stats.set_layouts_created, 1);
    assert_eq!(stats.pipeline_layouts_created, 1);
    assert_eq!(stats.pipelines_created, 1);
    assert_eq!(stats.dispatches, 3);
    assert_eq!(y.to_vec().unwrap()[63], 3.0);

    program.spec((32u32,));
    assert_eq!(program.state(), ProgramState::LayoutReady);
    program.call(&params, &[&y, &x]).unwrap();

    let stats = rig.sim.stats();
    assert_eq!(stats.set_layouts_created, 1);
    assert_eq!(stats.pipelines_created, 2);
    let mut expected = vec![4.0f32; 32];
    expected.extend([3.0f32; 32]);
    assert_eq!(y.to_vec().unwrap(), expected);
}

#[test]
fn rebinding_with_other_argument_types_fails() {
    let rig = discrete();
    let data = Buffer::<f32, kind::Host>::with_value(&rig.device, 4, 2.0).unwrap();
    let mut scale =
        Buffer::<f32, kind::Host>::with_usage(&rig.device, 1, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
    scale.from_host(&[3.0]).unwrap();

    let mut program = Program::<()>::new(&rig.device, &scale_kernel(&rig.sim)).unwrap();
    program.grid(1, 1, 1);
    program.call(&(), &[&data, &Uniform(&scale)]).unwrap();
    assert_eq!(data.to_vec().unwrap(), vec![6.0; 4]);

    let err = program.bind(&(), &[&data, &scale]).unwrap_err();
    match err {
        Error::SignatureMismatch { expected, found } => {
            assert_eq!(
                expected,
                vec![vk::DescriptorType::STORAGE_BUFFER, vk::DescriptorType::UNIFORM_BUFFER]
            );
            assert_eq!(
                found,
                vec![vk::DescriptorType::STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER]
            );
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn binding_preconditions_are_checked() {
    let rig = discrete();
    let data = Buffer::<f32, kind::Host>::new(&rig.device, 4).unwrap();
    let code = scale_kernel(&rig.sim);

    let mut program = Program::<()>::new(&rig.device, &code).unwrap();
    assert!(matches!(program.run(), Err(Error::Precondition(_))));
    assert!(matches!(
        program.bind(&(), &[&data]),
        Err(Error::Precondition(_))
    ));
    program.grid(1, 1, 1);
    assert!(matches!(program.bind(&(), &[]), Err(Error::Precondition(_))));
    assert!(matches!(program.run_async(false), Err(Error::Precondition(_))));

    let mut odd = Program::<[u8; 3]>::new(&rig.device, &code).unwrap();
    odd.grid(1, 1, 1);
    assert!(matches!(
        odd.bind(&[1, 2, 3], &[&data]),
        Err(Error::Precondition(_))
    ));
}

#[test]
fn bad_bytecode_and_missing_files_are_errors() {
    let rig = discrete();
    assert!(matches!(
        Program::<()>::new(&rig.device, &[0x0723_0203, 1, 2]),
        Err(Error::Vulkan {
            call: "vkCreateShaderModule",
            ..
        })
    ));
    assert!(matches!(
        Program::<()>::from_file(&rig.device, "shaders/missing.spv"),
        Err(Error::ShaderRead { .. })
    ));
}

#[test]
fn async_dispatch_completes_and_releases() {
    let rig = rig(SimConfig::integrated());
    let y = Buffer::<f32>::with_value(&rig.device, 64, 1.0).unwrap();
    let x = Buffer::<f32>::with_value(&rig.device, 64, 2.0).unwrap();

    let mut program = Program::<SaxpyParams>::new(&rig.device, &saxpy_kernel(&rig.sim)).unwrap();
    program
        .grid(1, 1, 1)
        .spec((64u32,))
        .bind(&SaxpyParams { size: 64, a: 0.5 }, &[&y, &x])
        .unwrap();
    let handle = program.run_async(false).unwrap();
    assert_eq!(program.state(), ProgramState::Submitted);
    assert!(matches!(program.run(), Err(Error::Precondition(_))));

    drop(handle);
    assert_eq!(y.to_vec().unwrap(), vec![2.0; 64]);

    drop(program);
    drop((x, y));
    assert_eq!(rig.sim.live_objects(), 1);
}

#[test]
fn suspended_dispatch_waits_for_resume() {
    let rig = discrete();
    let y = Buffer::<f32, kind::Host>::with_value(&rig.device, 128, 0.0).unwrap();
    let x = Buffer::<f32, kind::Host>::with_value(&rig.device, 128, 1.0).unwrap();

    let mut program = Program::<SaxpyParams>::new(&rig.device, &saxpy_kernel(&rig.sim)).unwrap();
    program
        .grid(2, 1, 1)
        .spec((64u32,))
        .bind(&SaxpyParams { size: 128, a: 0.1 }, &[&y, &x])
        .unwrap();

    let mut handle = program.run_async(true).unwrap();
    assert!(!handle.wait(0));
    assert!(handle.is_pending());
    assert_eq!(y.to_vec().unwrap(), vec![0.0; 128]);

    assert!(handle.resume());
    assert!(handle.wait(0));
    assert!(!handle.is_pending());
    assert!(y.to_vec().unwrap().iter().all(|v| (v - 0.1).abs() < 1e-6));
}

#[test]
fn pending_dispatches_keep_their_own_arguments() {
    let rig = discrete();
    let a = Buffer::<f32, kind::Host>::with_value(&rig.device, 4, 0.0).unwrap();
    let b = Buffer::<f32, kind::Host>::with_value(&rig.device, 4, 0.0).unwrap();

    let mut program = Program::<Add>::new(&rig.device, &add_kernel(&rig.sim)).unwrap();
    program.grid(1, 1, 1).bind(&Add { v: 1.0 }, &[&a]).unwrap();
    let mut first = program.run_async(true).unwrap();
    program.bind(&Add { v: 10.0 }, &[&b]).unwrap();
    let mut second = program.run_async(false).unwrap();

    assert!(first.resume());
    assert!(first.wait(u64::MAX));
    assert!(second.wait(u64::MAX));
    assert_eq!(a.to_vec().unwrap(), vec![1.0; 4]);
    assert_eq!(b.to_vec().unwrap(), vec![10.0; 4]);
}

#[test]
fn dropping_the_program_keeps_pending_work_valid() {
    let rig = discrete();
    let data = Buffer::<f32, kind::Host>::with_value(&rig.device, 4, 0.0).unwrap();

    let mut program = Program::<Add>::new(&rig.device, &add_kernel(&rig.sim)).unwrap();
    program.grid(1, 1, 1).bind(&Add { v: 1.0 }, &[&data]).unwrap();
    let mut handle = program.run_async(true).unwrap();
    drop(program);

    assert!(handle.resume());
    assert!(handle.wait(0));
    assert_eq!(data.to_vec().unwrap(), vec![1.0; 4]);

    drop(handle);
    drop(data);
    assert_eq!(rig.sim.live_objects(), 1, "pipeline and layouts go with the last dispatch");
}

#[test]
fn respecializing_keeps_the_pending_pipeline() {
    let rig = discrete();
    let data = Buffer::<f32, kind::Host>::with_value(&rig.device, 4, 0.0).unwrap();

    let mut program = Program::<Add>::new(&rig.device, &add_kernel(&rig.sim)).unwrap();
    program.grid(1, 1, 1).spec((4u32,));
    program.bind(&Add { v: 2.0 }, &[&data]).unwrap();
    let mut handle = program.run_async(true).unwrap();

    program.spec((8u32,));
    assert_eq!(program.state(), ProgramState::LayoutReady);
    assert!(handle.resume());
    assert!(handle.wait(0));
    assert_eq!(data.to_vec().unwrap(), vec![2.0; 4]);

    program.call(&Add { v: 1.0 }, &[&data]).unwrap();
    assert_eq!(rig.sim.stats().pipelines_created, 2);
    assert_eq!(data.to_vec().unwrap(), vec![3.0; 4]);
}
