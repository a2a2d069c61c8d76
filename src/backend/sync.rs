// Asynchronous completion
//
// `Delayed` turns "has the GPU finished this submission" into a value.
// It owns the submission's fence (and optionally a gating event) and a
// deferred action, usually "free the command buffer and release the buffers
// it used". The action runs exactly once: on the first `wait` that sees the
// fence signaled, or on drop, which waits without a timeout.

use ash::vk;
use std::sync::Arc;

use super::device::Device;
use super::error::{Result, VkResultExt};

type Action = Box<dyn FnOnce() + Send>;

#[must_use = "dropping a Delayed blocks until the GPU work completes"]
pub struct Delayed {
    // `None` once the action has run, or when construction failed
    device: Option<Arc<Device>>,
    fence: vk::Fence,
    event: Option<vk::Event>,
    action: Option<Action>,
    status: vk::Result,
}

impl std::fmt::Debug for Delayed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delayed")
            .field("fence", &self.fence)
            .field("event", &self.event)
            .field("status", &self.status)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

impl Delayed {
    /// Take ownership of a fence whose submission is already queued
    pub fn new(
        device: Arc<Device>,
        fence: vk::Fence,
        action: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            device: Some(device),
            fence,
            event: None,
            action: Some(Box::new(action)),
            status: vk::Result::SUCCESS,
        }
    }

    /// Same as `new`, with an event gating the submitted commands
    pub fn with_event(
        device: Arc<Device>,
        fence: vk::Fence,
        event: vk::Event,
        action: impl FnOnce() + Send + 'static,
    ) -> Self {
        let mut delayed = Self::new(device, fence, action);
        delayed.event = Some(event);
        delayed
    }

    /// Placeholder for "nothing was submitted": the fence starts signaled
    pub fn signaled(device: Arc<Device>, action: impl FnOnce() + Send + 'static) -> Result<Self> {
        let fence = device
            .driver()
            .create_fence(true)
            .context_vk("vkCreateFence")?;
        Ok(Self::new(device, fence, action))
    }

    /// An inert handle recording why construction failed. `wait` is a no-op.
    pub fn failed(status: vk::Result) -> Self {
        Self {
            device: None,
            fence: vk::Fence::null(),
            event: None,
            action: None,
            status,
        }
    }

    /// Result code of the submission this handle wraps
    pub fn status(&self) -> vk::Result {
        self.status
    }

    /// Whether the deferred action has yet to run
    pub fn is_pending(&self) -> bool {
        self.device.is_some()
    }

    /// Block until the fence signals or `timeout_ns` elapses.
    ///
    /// Returns `true` once the work is known complete (also for handles that
    /// already completed or never held work). On timeout nothing changes and
    /// the handle can be waited on again.
    pub fn wait(&mut self, timeout_ns: u64) -> bool {
        let Some(device) = self.device.as_ref() else {
            return true;
        };

        match device.driver().wait_for_fence(self.fence, timeout_ns) {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => return false,
            Err(e) => {
                // Device loss: the fence will never signal, release anyway
                log::error!("Waiting for fence {:?} failed: {}", self.fence, e);
            }
        }

        self.complete();
        true
    }

    /// Wait without a timeout
    pub fn wait_forever(&mut self) {
        self.wait(u64::MAX);
    }

    /// Set the gating event so suspended work can start.
    ///
    /// Must be called from the thread that created the handle. Returns
    /// whether an event existed and was set.
    pub fn resume(&self) -> bool {
        match (self.event, self.device.as_ref()) {
            (Some(event), Some(device)) => match device.driver().set_event(event) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("vkSetEvent failed: {}", e);
                    false
                }
            },
            _ => false,
        }
    }

    fn complete(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        if let Some(action) = self.action.take() {
            action();
        }

        let driver = device.driver();
        driver.destroy_fence(std::mem::replace(&mut self.fence, vk::Fence::null()));
        if let Some(event) = self.event.take() {
            driver.destroy_event(event);
        }
    }
}

impl Drop for Delayed {
    fn drop(&mut self) {
        self.wait(u64::MAX);
    }
}
