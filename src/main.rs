// =============================================================================
// VK-DISPATCH DEMO - saxpy on the GPU
// =============================================================================
//
// Runs y = a * x + y through the compute runtime and checks the result on
// the host.
//
// FLOW:
// 1. Load config.toml and initialize logging
// 2. Create the instance and open the preferred device
// 3. Upload x and y into device-local buffers (staged)
// 4. Build the kernel with the workgroup size as specialization constant 0
// 5. Dispatch synchronously, then again through a Delayed handle
// 6. Download y and compare with the host computation
//
// =============================================================================

use anyhow::{ensure, Context, Result};
use bytemuck::{Pod, Zeroable};
use std::time::Instant;

use vk_dispatch::config::{Config, LoggingConfig};
use vk_dispatch::{copy_async, kind, log_sink, Buffer, Instance, Program};

/// Push-constant block of shaders/saxpy.comp
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SaxpyParams {
    size: u32,
    a: f32,
}

const TOLERANCE: f32 = 1e-5;

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config.logging);
    log::info!("Starting vk-dispatch saxpy demo");
    log::info!(
        "Problem size: {} elements, workgroup size {}",
        config.saxpy.size,
        config.saxpy.workgroup_size
    );

    let instance = Instance::new(&config.instance, log_sink())
        .context("Failed to create Vulkan instance")?;
    let device = instance
        .default_device(&config.device)
        .context("Failed to open a compute device")?;
    log::info!("Running on {}", device.name());

    let saxpy = &config.saxpy;
    let n = saxpy.size as usize;
    let x_host: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let y_host: Vec<f32> = (0..n).map(|i| (2 * i) as f32).collect();

    let upload_start = Instant::now();
    let x = Buffer::<f32>::from_slice(&device, &x_host)?;
    let mut y = Buffer::<f32>::from_slice(&device, &y_host)?;
    log::info!(
        "Uploaded {} bytes in {:.2?} ({:?} memory)",
        x.size_bytes() + y.size_bytes(),
        upload_start.elapsed(),
        y.memory_class()
    );

    let mut program = Program::<SaxpyParams>::from_file(&device, &saxpy.shader)
        .with_context(|| format!("Failed to load kernel {:?}", saxpy.shader))?;
    let params = SaxpyParams {
        size: saxpy.size,
        a: saxpy.a,
    };

    // Synchronous dispatch
    let dispatch_start = Instant::now();
    program
        .grid(saxpy.groups(), 1, 1)
        .spec((saxpy.workgroup_size,))
        .call(&params, &[&y, &x])?;
    log::info!("Synchronous dispatch took {:.2?}", dispatch_start.elapsed());

    let expected: Vec<f32> = y_host
        .iter()
        .zip(&x_host)
        .map(|(y, x)| y + saxpy.a * x)
        .collect();
    verify(&y.to_vec()?, &expected)?;

    // Same kernel through a Delayed handle, result copied to a host buffer
    y.from_host(&y_host)?;
    let readback = Buffer::<f32, kind::HostCached>::new(&device, n)?;
    let async_start = Instant::now();
    program.bind(&params, &[&y, &x])?;
    let mut dispatch = program.run_async(false)?;
    dispatch.wait_forever();
    let mut copy = copy_async(&y, 0..n, &readback, 0)?;
    copy.wait_forever();
    log::info!("Asynchronous dispatch and copy took {:.2?}", async_start.elapsed());
    verify(&readback.to_vec()?, &expected)?;

    log::info!("saxpy verified on {} elements", n);
    Ok(())
}

fn verify(actual: &[f32], expected: &[f32]) -> Result<()> {
    ensure!(
        actual.len() == expected.len(),
        "result has {} elements, expected {}",
        actual.len(),
        expected.len()
    );
    let max_error = actual
        .iter()
        .zip(expected)
        .map(|(a, e)| (a - e).abs() / e.abs().max(1.0))
        .fold(0.0f32, f32::max);
    log::info!("Max relative error: {:e}", max_error);
    ensure!(
        max_error <= TOLERANCE,
        "max relative error {} exceeds {}",
        max_error,
        TOLERANCE
    );
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use env_logger::{Builder, Env};

    // RUST_LOG wins over the configured level
    Builder::from_env(Env::default().default_filter_or(config.level_filter().as_str())).init();
}
