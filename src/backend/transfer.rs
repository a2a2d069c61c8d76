// Buffer-to-buffer copies on the transfer queue
//
// Synchronous copies wait for the queue to drain. `copy_async` returns a
// `Delayed` that keeps both buffers and the command buffer alive until the
// copy has finished.

use ash::vk;
use bytemuck::Pod;
use std::ops::Range;
use std::sync::Arc;

use super::buffer::{Buffer, RawBuffer};
use super::device::{Device, QueueKind};
use super::error::{Error, Result, VkResultExt};
use super::memory::MemoryKind;
use super::sync::Delayed;

fn record_copy(
    device: &Device,
    src: &RawBuffer,
    src_offset: vk::DeviceSize,
    dst: &RawBuffer,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> Result<vk::CommandBuffer> {
    let cmd = device.begin_commands(QueueKind::Transfer)?;
    let region = vk::BufferCopy {
        src_offset,
        dst_offset,
        size,
    };
    device
        .driver()
        .cmd_copy_buffer(cmd, src.handle(), dst.handle(), region);
    device.end_commands(QueueKind::Transfer, cmd)?;
    Ok(cmd)
}

/// Copy `size` bytes between raw buffers and wait for completion
pub(crate) fn copy_raw(
    src: &RawBuffer,
    src_offset: vk::DeviceSize,
    dst: &RawBuffer,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> Result<()> {
    let device = dst.device();
    let cmd = record_copy(device, src, src_offset, dst, dst_offset, size)?;
    device.submit_and_wait(QueueKind::Transfer, cmd)
}

/// Byte range of an element range, checked against both buffers
fn byte_region<T, M1, M2>(
    src: &Buffer<T, M1>,
    range: &Range<usize>,
    dst: &Buffer<T, M2>,
    dst_offset: usize,
) -> Result<(vk::DeviceSize, vk::DeviceSize, vk::DeviceSize)>
where
    T: Pod,
    M1: MemoryKind,
    M2: MemoryKind,
{
    if range.start > range.end || range.end > src.len() {
        return Err(Error::precondition(format!(
            "source range {:?} outside buffer of {} elements",
            range,
            src.len()
        )));
    }
    let count = range.end - range.start;
    if dst_offset + count > dst.len() {
        return Err(Error::precondition(format!(
            "{} elements at offset {} overflow destination of {}",
            count,
            dst_offset,
            dst.len()
        )));
    }
    if !Arc::ptr_eq(src.device(), dst.device()) {
        return Err(Error::precondition("buffers belong to different devices"));
    }

    let elem = std::mem::size_of::<T>() as vk::DeviceSize;
    Ok((
        range.start as vk::DeviceSize * elem,
        dst_offset as vk::DeviceSize * elem,
        count as vk::DeviceSize * elem,
    ))
}

/// Copy all of `src` into the start of `dst`
pub fn copy<T, M1, M2>(src: &Buffer<T, M1>, dst: &Buffer<T, M2>) -> Result<()>
where
    T: Pod,
    M1: MemoryKind,
    M2: MemoryKind,
{
    copy_range(src, 0..src.len(), dst, 0)
}

/// Copy `src[range]` into `dst` starting at element `dst_offset`
pub fn copy_range<T, M1, M2>(
    src: &Buffer<T, M1>,
    range: Range<usize>,
    dst: &Buffer<T, M2>,
    dst_offset: usize,
) -> Result<()>
where
    T: Pod,
    M1: MemoryKind,
    M2: MemoryKind,
{
    let (src_offset, dst_offset, size) = byte_region(src, &range, dst, dst_offset)?;
    if size == 0 {
        return Ok(());
    }
    copy_raw(src.raw(), src_offset, dst.raw(), dst_offset, size)
}

/// Start copying `src[range]` into `dst` at element `dst_offset`.
///
/// Disjoint destination ranges may be copied concurrently.
pub fn copy_async<T, M1, M2>(
    src: &Buffer<T, M1>,
    range: Range<usize>,
    dst: &Buffer<T, M2>,
    dst_offset: usize,
) -> Result<Delayed>
where
    T: Pod,
    M1: MemoryKind,
    M2: MemoryKind,
{
    let (src_offset, dst_offset, size) = byte_region(src, &range, dst, dst_offset)?;
    let device = dst.device().clone();
    if size == 0 {
        return Delayed::signaled(device, || {});
    }

    let cmd = record_copy(&device, src.raw(), src_offset, dst.raw(), dst_offset, size)?;
    let fence = match device.driver().create_fence(false) {
        Ok(fence) => fence,
        Err(result) => {
            device.free_commands(QueueKind::Transfer, cmd);
            return Err(result).context_vk("vkCreateFence");
        }
    };
    if let Err(e) = device.submit(QueueKind::Transfer, cmd, fence) {
        device.driver().destroy_fence(fence);
        device.free_commands(QueueKind::Transfer, cmd);
        return Err(e);
    }

    let keep = (src.raw().clone(), dst.raw().clone());
    let owner = device.clone();
    Ok(Delayed::new(device, fence, move || {
        owner.free_commands(QueueKind::Transfer, cmd);
        drop(keep);
    }))
}
