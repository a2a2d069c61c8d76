// Device buffers
//
// `Buffer<T, M>` owns one native buffer and the memory bound to it at offset
// 0. `M` is the requested memory kind; the memory actually obtained may be a
// fallback class, and every host exchange consults the obtained flags:
//
// - host-visible memory is mapped and copied directly
// - anything else goes through a staging buffer and a transfer-queue copy

use ash::vk;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::device::Device;
use super::error::{Error, Result};
use super::memory::{
    kind, Allocation, Allocator, HostExchange, HostMappable, MemoryClass, MemoryKind,
};
use super::transfer;

/// Native buffer plus its memory; released together when the last user lets go.
///
/// Shared between the owning `Buffer` and any in-flight submission that reads
/// or writes it.
pub struct RawBuffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Allocation,
    requested: MemoryClass,
}

impl std::fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuffer")
            .field("buffer", &self.buffer)
            .field("requested", &self.requested)
            .field("obtained", &self.allocation.class)
            .field("flags", &self.allocation.flags)
            .finish_non_exhaustive()
    }
}

impl RawBuffer {
    /// Create a buffer of `size` bytes and bind memory of class `class` (or a fallback)
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        class: MemoryClass,
        extra_usage: vk::BufferUsageFlags,
    ) -> Result<Arc<Self>> {
        let mut allocator = Allocator::new(class);
        // Zero-sized buffers are invalid in Vulkan
        let buffer = allocator.make_buffer(device, size.max(1), extra_usage)?;

        let allocation =
            match allocator.allocate_memory(device, buffer, vk::MemoryPropertyFlags::empty()) {
                Ok(allocation) => allocation,
                Err(e) => {
                    device.driver().destroy_buffer(buffer);
                    return Err(e);
                }
            };

        if let Err(e) = device.bind_buffer_memory(buffer, allocation.memory) {
            device.driver().free_memory(allocation.memory);
            device.driver().destroy_buffer(buffer);
            return Err(e);
        }

        Ok(Arc::new(Self {
            device: device.clone(),
            buffer,
            allocation,
            requested: class,
        }))
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.allocation.memory
    }

    pub fn flags(&self) -> vk::MemoryPropertyFlags {
        self.allocation.flags
    }

    pub fn obtained(&self) -> MemoryClass {
        self.allocation.class
    }

    pub fn requested(&self) -> MemoryClass {
        self.requested
    }

    pub fn is_host_visible(&self) -> bool {
        self.flags().contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn is_coherent(&self) -> bool {
        self.flags().contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Copy `bytes` into the start of the mapped memory
    fn write_mapped(&self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        let ptr = self
            .device
            .map_memory(self.memory(), offset, bytes.len() as vk::DeviceSize)?;
        // SAFETY: the mapping covers `bytes.len()` bytes and nothing else
        // references it while mapped.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        }
        let flushed = if self.is_coherent() {
            Ok(())
        } else {
            self.device.driver().flush_memory(self.memory())
        };
        self.device.unmap_memory(self.memory());
        flushed.map_err(|result| Error::Vulkan {
            call: "vkFlushMappedMemoryRanges",
            result,
        })
    }

    /// Copy the start of the mapped memory into `bytes`
    fn read_mapped(&self, offset: vk::DeviceSize, bytes: &mut [u8]) -> Result<()> {
        let ptr = self
            .device
            .map_memory(self.memory(), offset, bytes.len() as vk::DeviceSize)?;
        if !self.is_coherent() {
            if let Err(result) = self.device.driver().invalidate_memory(self.memory()) {
                self.device.unmap_memory(self.memory());
                return Err(Error::Vulkan {
                    call: "vkInvalidateMappedMemoryRanges",
                    result,
                });
            }
        }
        // SAFETY: as in `write_mapped`
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.cast::<u8>().cast_const(),
                bytes.as_mut_ptr(),
                bytes.len(),
            );
        }
        self.device.unmap_memory(self.memory());
        Ok(())
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        let driver = self.device.driver();
        driver.free_memory(self.allocation.memory);
        driver.destroy_buffer(self.buffer);
    }
}

/// Array of `T` in device memory of kind `M`
pub struct Buffer<T, M = kind::DeviceLocal> {
    raw: Arc<RawBuffer>,
    len: usize,
    _marker: PhantomData<(fn() -> T, M)>,
}

impl<T, M> std::fmt::Debug for Buffer<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("raw", &self.raw)
            .finish()
    }
}

impl<T: Pod, M: MemoryKind> Buffer<T, M> {
    /// Uninitialized buffer of `len` elements
    pub fn new(device: &Arc<Device>, len: usize) -> Result<Self> {
        Self::with_usage(device, len, vk::BufferUsageFlags::empty())
    }

    /// Uninitialized buffer with extra usage flags on top of the class defaults
    pub fn with_usage(
        device: &Arc<Device>,
        len: usize,
        extra_usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| {
                Error::precondition(format!("a buffer of {} elements overflows usize", len))
            })?;
        let raw = RawBuffer::new(device, size as vk::DeviceSize, M::CLASS, extra_usage)?;
        Ok(Self {
            raw,
            len,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes; cannot overflow since construction checked it
    pub fn size_bytes(&self) -> vk::DeviceSize {
        (self.len * std::mem::size_of::<T>()) as vk::DeviceSize
    }

    pub fn handle(&self) -> vk::Buffer {
        self.raw.handle()
    }

    pub fn device(&self) -> &Arc<Device> {
        self.raw.device()
    }

    /// Property flags of the memory actually bound
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.raw.flags()
    }

    /// Class whose flags the bound memory satisfies; differs from `M` after a fallback
    pub fn memory_class(&self) -> MemoryClass {
        self.raw.obtained()
    }

    pub fn is_host_visible(&self) -> bool {
        self.raw.is_host_visible()
    }

    pub fn raw(&self) -> &Arc<RawBuffer> {
        &self.raw
    }
}

impl<T: Pod, M: HostExchange> Buffer<T, M> {
    /// Buffer of `len` copies of `value`
    pub fn with_value(device: &Arc<Device>, len: usize, value: T) -> Result<Self> {
        Self::from_slice(device, &vec![value; len])
    }

    /// Buffer holding a copy of `data`
    pub fn from_slice(device: &Arc<Device>, data: &[T]) -> Result<Self> {
        let mut buffer = Self::new(device, data.len())?;
        buffer.from_host(data)?;
        Ok(buffer)
    }

    /// Buffer holding the items of `iter`
    pub fn from_iter<I>(device: &Arc<Device>, iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
    {
        let data: Vec<T> = iter.into_iter().collect();
        Self::from_slice(device, &data)
    }

    /// Buffer of `len` elements where element `i` is `f(i)`
    pub fn from_fn(device: &Arc<Device>, len: usize, f: impl FnMut(usize) -> T) -> Result<Self> {
        let data: Vec<T> = (0..len).map(f).collect();
        Self::from_slice(device, &data)
    }

    /// Overwrite the first `src.len()` elements with `src`
    pub fn from_host(&mut self, src: &[T]) -> Result<()> {
        if src.len() > self.len {
            return Err(Error::precondition(format!(
                "copying {} elements into a buffer of {}",
                src.len(),
                self.len
            )));
        }
        if src.is_empty() {
            return Ok(());
        }

        let bytes: &[u8] = bytemuck::cast_slice(src);
        if self.raw.is_host_visible() {
            return self.raw.write_mapped(0, bytes);
        }

        let staging = Buffer::<T, kind::HostCoherent>::new(self.device(), src.len())?;
        staging.raw.write_mapped(0, bytes)?;
        transfer::copy_raw(&staging.raw, 0, &self.raw, 0, bytes.len() as vk::DeviceSize)
    }

    /// Copy the first `dst.len()` elements into `dst`
    pub fn to_host(&self, dst: &mut [T]) -> Result<()> {
        if dst.len() > self.len {
            return Err(Error::precondition(format!(
                "reading {} elements from a buffer of {}",
                dst.len(),
                self.len
            )));
        }
        if dst.is_empty() {
            return Ok(());
        }

        let len = dst.len();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        if self.raw.is_host_visible() {
            return self.raw.read_mapped(0, bytes);
        }

        let staging = Buffer::<T, kind::HostCached>::new(self.device(), len)?;
        transfer::copy_raw(&self.raw, 0, &staging.raw, 0, bytes.len() as vk::DeviceSize)?;
        staging.raw.read_mapped(0, bytes)
    }

    /// Copy the first `dst.len()` elements into `dst`, transforming each one
    pub fn to_host_with<U>(&self, dst: &mut [U], mut f: impl FnMut(T) -> U) -> Result<()> {
        let mut host = vec![T::zeroed(); dst.len()];
        self.to_host(&mut host)?;
        for (d, s) in dst.iter_mut().zip(host) {
            *d = f(s);
        }
        Ok(())
    }

    /// Whole contents as a vector
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut host = vec![T::zeroed(); self.len];
        self.to_host(&mut host)?;
        Ok(host)
    }
}

impl<T: Pod, M: HostMappable> Buffer<T, M> {
    /// Map the whole buffer for direct access. Unmapped when the guard drops.
    pub fn map(&mut self) -> Result<Mapped<'_, T>> {
        let size = self.size_bytes();
        let ptr = self.raw.device().map_memory(self.raw.memory(), 0, size.max(1))?;
        let mapped = Mapped {
            raw: &self.raw,
            ptr: ptr.cast::<u8>(),
            len: self.len,
            _marker: PhantomData,
        };

        if !self.raw.is_coherent() {
            self.raw
                .device()
                .driver()
                .invalidate_memory(self.raw.memory())
                .map_err(|result| Error::Vulkan {
                    call: "vkInvalidateMappedMemoryRanges",
                    result,
                })?;
        }
        if mapped.len > 0 && (ptr as usize) % std::mem::align_of::<T>() != 0 {
            return Err(Error::precondition("mapped pointer is not aligned for the element type"));
        }
        Ok(mapped)
    }
}

/// Mapped view of a host-visible buffer
pub struct Mapped<'a, T> {
    raw: &'a RawBuffer,
    ptr: *mut u8,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T: Pod> Deref for Mapped<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: the mapping spans `len` elements, is aligned (checked in
        // `map`) and is exclusively borrowed through the buffer.
        unsafe { std::slice::from_raw_parts(self.ptr.cast::<T>(), self.len) }
    }
}

impl<T: Pod> DerefMut for Mapped<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: see `deref`
        unsafe { std::slice::from_raw_parts_mut(self.ptr.cast::<T>(), self.len) }
    }
}

impl<T> Drop for Mapped<'_, T> {
    fn drop(&mut self) {
        if !self.raw.is_coherent() {
            if let Err(e) = self.raw.device().driver().flush_memory(self.raw.memory()) {
                log::error!("vkFlushMappedMemoryRanges failed: {}", e);
            }
        }
        self.raw.device().unmap_memory(self.raw.memory());
    }
}
