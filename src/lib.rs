//! Host-side runtime for Vulkan compute.
//!
//! Open a [`Device`], create typed [`Buffer`]s in a chosen memory class, and
//! dispatch compute [`Program`]s over them, synchronously or through a
//! [`Delayed`] completion handle.
//!
//! ```no_run
//! use vk_dispatch::{config::Config, kind, log_sink, Buffer, Instance, Program};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::default();
//! let instance = Instance::new(&config.instance, log_sink())?;
//! let device = instance.default_device(&config.device)?;
//!
//! let data = Buffer::<f32, kind::Host>::from_slice(&device, &[1.0; 256])?;
//! let mut program = Program::<()>::from_file(&device, "shaders/double.spv")?;
//! program.grid(4, 1, 1).call(&(), &[&data])?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;

pub use backend::*;
