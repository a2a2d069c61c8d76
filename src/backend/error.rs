// Error types for the compute runtime
//
// Four families of failure:
// - driver status codes from object creation, allocation, submission, mapping
// - memory exhaustion after a whole fallback chain was tried
// - caller contract violations (checked instead of left undefined)
// - shader bytecode that could not be read

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

use super::memory::MemoryClass;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no memory type satisfies {class:?} or any of its fallbacks")]
    NoSuitableMemoryFound { class: MemoryClass },

    #[error("out of device memory allocating {size} bytes as {class:?}")]
    OutOfDeviceMemory {
        class: MemoryClass,
        size: vk::DeviceSize,
    },

    #[error("failed to read shader {path:?}: {source}")]
    ShaderRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid shader bytecode: {0}")]
    ShaderFormat(String),

    #[error(
        "program was built for arguments {expected:?} but was bound with {found:?}"
    )]
    SignatureMismatch {
        expected: Vec<vk::DescriptorType>,
        found: Vec<vk::DescriptorType>,
    },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("no Vulkan device with a compute queue found")]
    NoSuitableDevice,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Raw status code, if this error came straight from the driver
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }
}

/// Attach the failing entry point's name to a raw driver status
pub trait VkResultExt<T> {
    fn context_vk(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn context_vk(self, call: &'static str) -> Result<T> {
        self.map_err(|result| Error::Vulkan { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_vk_names_the_call() {
        let err = Err::<(), _>(vk::Result::ERROR_DEVICE_LOST)
            .context_vk("vkQueueSubmit")
            .unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert!(err.to_string().starts_with("vkQueueSubmit failed"));
    }
}
