// Memory classes and the tiered allocator
//
// A memory class names a placement policy: the property flags it needs, the
// buffer usage it implies, and the class to retry with when the device cannot
// satisfy it. Allocation walks that chain until something succeeds.
//
//   DeviceLocal      ─┐
//   DeviceLocalOnly  ─┤
//   HostVisibleCoherent ─┼──> HostVisible ──> (fatal)
//   HostVisibleCached   ─┘
//   DeviceLocalHostVisible ──> (fatal)

use ash::vk;

use super::device::Device;
use super::error::{Error, Result, VkResultExt};
use super::report::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Plain host-visible memory; end of every fallback chain
    HostVisible,
    /// Staging memory for host-to-device uploads
    HostVisibleCoherent,
    /// Staging memory for device-to-host readback
    HostVisibleCached,
    /// Fast device memory, may degrade to host memory on small devices
    DeviceLocal,
    /// Memory both device-local and host-visible, no fallback
    DeviceLocalHostVisible,
    /// Device memory the host never touches directly
    DeviceLocalOnly,
}

const STORAGE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

impl MemoryClass {
    pub const ALL: [MemoryClass; 6] = [
        MemoryClass::HostVisible,
        MemoryClass::HostVisibleCoherent,
        MemoryClass::HostVisibleCached,
        MemoryClass::DeviceLocal,
        MemoryClass::DeviceLocalHostVisible,
        MemoryClass::DeviceLocalOnly,
    ];

    pub const fn properties(self) -> vk::MemoryPropertyFlags {
        use vk::MemoryPropertyFlags as F;
        match self {
            Self::HostVisible => F::HOST_VISIBLE,
            Self::HostVisibleCoherent => {
                F::from_raw(F::HOST_VISIBLE.as_raw() | F::HOST_COHERENT.as_raw())
            }
            Self::HostVisibleCached => {
                F::from_raw(F::HOST_VISIBLE.as_raw() | F::HOST_CACHED.as_raw())
            }
            Self::DeviceLocal | Self::DeviceLocalOnly => F::DEVICE_LOCAL,
            Self::DeviceLocalHostVisible => {
                F::from_raw(F::DEVICE_LOCAL.as_raw() | F::HOST_VISIBLE.as_raw())
            }
        }
    }

    pub const fn usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::HostVisibleCoherent => vk::BufferUsageFlags::TRANSFER_SRC,
            Self::HostVisibleCached => vk::BufferUsageFlags::TRANSFER_DST,
            Self::HostVisible
            | Self::DeviceLocal
            | Self::DeviceLocalHostVisible
            | Self::DeviceLocalOnly => STORAGE_USAGE,
        }
    }

    pub const fn fallback(self) -> Option<MemoryClass> {
        match self {
            Self::HostVisibleCoherent
            | Self::HostVisibleCached
            | Self::DeviceLocal
            | Self::DeviceLocalOnly => Some(Self::HostVisible),
            Self::HostVisible | Self::DeviceLocalHostVisible => None,
        }
    }

    /// The class followed by each of its fallbacks, in the order they are tried
    pub fn chain(self) -> impl Iterator<Item = MemoryClass> {
        std::iter::successors(Some(self), |class| class.fallback())
    }
}

/// Compile-time memory kind carried by `Buffer<T, M>`
pub trait MemoryKind: Send + Sync + 'static {
    const CLASS: MemoryClass;
}

/// Kinds whose buffers may exchange data with the host, directly or staged
pub trait HostExchange: MemoryKind {}

/// Kinds whose every fallback is host-visible, so mapping never needs staging
pub trait HostMappable: HostExchange {}

pub mod kind {
    use super::{HostExchange, HostMappable, MemoryClass, MemoryKind};

    macro_rules! memory_kind {
        ($(#[$meta:meta])* $name:ident => $class:ident $(, $extra:ident)*) => {
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default)]
            pub struct $name;

            impl MemoryKind for $name {
                const CLASS: MemoryClass = MemoryClass::$class;
            }

            $(impl $extra for $name {})*
        };
    }

    memory_kind!(
        /// Host-visible memory
        Host => HostVisible, HostExchange, HostMappable
    );
    memory_kind!(
        /// Host-coherent staging memory, transfer source only
        HostCoherent => HostVisibleCoherent, HostExchange, HostMappable
    );
    memory_kind!(
        /// Host-cached readback memory, transfer destination only
        HostCached => HostVisibleCached, HostExchange, HostMappable
    );
    memory_kind!(
        /// Device-local memory, host access staged when necessary
        DeviceLocal => DeviceLocal, HostExchange
    );
    memory_kind!(
        /// Device-local and host-visible at once
        Unified => DeviceLocalHostVisible, HostExchange, HostMappable
    );
    memory_kind!(
        /// Device-local memory without any host exchange
        DeviceOnly => DeviceLocalOnly
    );
}

/// Memory obtained for one buffer
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub memory_type: u32,
    pub class: MemoryClass,
    pub flags: vk::MemoryPropertyFlags,
    pub size: vk::DeviceSize,
}

/// Allocator for one memory class, walking the fallback chain on failure
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    class: MemoryClass,
    memory_id: Option<u32>,
}

impl Allocator {
    pub fn new(class: MemoryClass) -> Self {
        Self {
            class,
            memory_id: None,
        }
    }

    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// Create a buffer with this class's usage plus `extra_usage`. No memory yet.
    pub fn make_buffer(
        &self,
        device: &Device,
        size: vk::DeviceSize,
        extra_usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer> {
        device
            .driver()
            .create_buffer(size, self.class.usage() | extra_usage)
            .context_vk("vkCreateBuffer")
    }

    /// Find a memory type for `buffer`, degrading along the fallback chain.
    ///
    /// Returns the type index and the class whose flags it satisfies.
    pub fn find_memory_type(
        &self,
        device: &Device,
        buffer: vk::Buffer,
        extra_properties: vk::MemoryPropertyFlags,
    ) -> Result<(u32, MemoryClass)> {
        let requirements = device.driver().buffer_memory_requirements(buffer);
        let flags = self.class.properties() | extra_properties;
        if let Some(index) = device.memory_type_matching(&requirements, flags) {
            return Ok((index, self.class));
        }

        match self.class.fallback() {
            Some(fallback) => {
                let message = format!(
                    "no memory type with {:?} for {:?}, falling back to {:?}",
                    flags, self.class, fallback
                );
                device.report(
                    &Report::new(
                        vk::DebugReportFlagsEXT::PERFORMANCE_WARNING,
                        "vk-dispatch::memory",
                        &message,
                    )
                    .object(vk::DebugReportObjectTypeEXT::BUFFER, vk::Handle::as_raw(buffer)),
                );
                Allocator::new(fallback).find_memory_type(device, buffer, extra_properties)
            }
            None => Err(Error::NoSuitableMemoryFound { class: self.class }),
        }
    }

    /// Allocate memory for `buffer`. Does not bind it.
    pub fn allocate_memory(
        &mut self,
        device: &Device,
        buffer: vk::Buffer,
        extra_properties: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let (memory_type, class) = self.find_memory_type(device, buffer, extra_properties)?;
        let size = device.driver().buffer_memory_requirements(buffer).size;

        match device.driver().allocate_memory(size, memory_type) {
            Ok(memory) => {
                self.memory_id = Some(memory_type);
                let flags = device.memory_type_flags(memory_type);
                log::debug!(
                    "Allocated {} bytes of {:?} memory (type {}, {:?})",
                    size,
                    class,
                    memory_type,
                    flags
                );
                Ok(Allocation {
                    memory,
                    memory_type,
                    class,
                    flags,
                    size,
                })
            }
            Err(result) => {
                let Some(fallback) = class.fallback() else {
                    return Err(match result {
                        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                        | vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfDeviceMemory {
                            class,
                            size,
                        },
                        result => Error::Vulkan {
                            call: "vkAllocateMemory",
                            result,
                        },
                    });
                };

                let message = format!(
                    "allocating {} bytes as {:?} failed ({}), retrying as {:?}",
                    size, class, result, fallback
                );
                device.report(
                    &Report::new(
                        vk::DebugReportFlagsEXT::WARNING,
                        "vk-dispatch::memory",
                        &message,
                    )
                    .object(vk::DebugReportObjectTypeEXT::BUFFER, vk::Handle::as_raw(buffer)),
                );

                let mut fallback = Allocator::new(fallback);
                let allocation = fallback.allocate_memory(device, buffer, extra_properties)?;
                self.memory_id = fallback.memory_id;
                Ok(allocation)
            }
        }
    }

    /// Memory type used by the last successful `allocate_memory`
    pub fn memory_id(&self) -> Result<u32> {
        self.memory_id
            .ok_or_else(|| Error::precondition("memory type read before a successful allocation"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_chain_terminates() {
        for class in MemoryClass::ALL {
            let chain: Vec<_> = class.chain().collect();
            assert!(chain.len() <= 2, "{class:?}: {chain:?}");
            let last = *chain.last().unwrap();
            assert!(last.fallback().is_none());
        }
    }

    #[test]
    fn chains_end_at_host_visible_except_unified() {
        for class in MemoryClass::ALL {
            let last = class.chain().last().unwrap();
            if class == MemoryClass::DeviceLocalHostVisible {
                assert_eq!(last, class);
            } else {
                assert_eq!(last, MemoryClass::HostVisible, "{class:?}");
            }
        }
    }

    #[test]
    fn staging_classes_have_transfer_usage() {
        assert!(MemoryClass::HostVisibleCoherent
            .usage()
            .contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(MemoryClass::HostVisibleCached
            .usage()
            .contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(MemoryClass::DeviceLocal
            .usage()
            .contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn memory_id_before_allocation_is_an_error() {
        let allocator = Allocator::new(MemoryClass::DeviceLocal);
        assert!(matches!(allocator.memory_id(), Err(Error::Precondition(_))));
    }
}
