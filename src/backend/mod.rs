// Backend module - Vulkan compute runtime
//
// Design: every native call goes through the `Driver` trait, so the same
// resource types run on a real GPU (`vulkan`) or in host memory (`sim`).
// Resources hold an `Arc<Device>`; the device outlives all of them.

pub mod buffer;
pub mod device;
pub mod driver;
pub mod error;
pub mod instance;
pub mod memory;
pub mod program;
pub mod report;
pub mod shader;
pub mod sim;
pub mod sync;
pub mod transfer;
pub mod vulkan;

pub use buffer::{Buffer, Mapped, RawBuffer};
pub use device::{Device, QueueKind};
pub use driver::{Driver, QueueFamilies};
pub use error::{Error, Result};
pub use instance::{Instance, PhysicalDevice};
pub use memory::{kind, Allocator, MemoryClass, MemoryKind};
pub use program::{Argument, Program, ProgramState, SpecConstants, Uniform};
pub use report::{log_sink, LogSink, Report, ReportSink};
pub use sim::{Invocation, SimConfig, SimDriver};
pub use sync::Delayed;
pub use transfer::{copy, copy_async, copy_range};
