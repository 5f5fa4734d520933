//! Synchronization primitives.

use crate::context::GpuContext;
use crate::error::Result;
use ash::vk;

/// Host-visible completion signal for a submission.
pub struct Fence {
    ctx: GpuContext,
    fence: vk::Fence,
}

impl Fence {
    pub(crate) fn new(ctx: GpuContext, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { ctx.device().create_fence(&create_info, None)? };
        Ok(Self { ctx, fence })
    }

    pub fn raw(&self) -> vk::Fence {
        self.fence
    }

    /// Wait for the fence to be signaled.
    ///
    /// Returns `false` if `timeout_ns` elapsed first.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        match unsafe {
            self.ctx
                .device()
                .wait_for_fences(&[self.fence], true, timeout_ns)
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the fence is currently signaled.
    pub fn is_signaled(&self) -> Result<bool> {
        Ok(unsafe { self.ctx.device().get_fence_status(self.fence)? })
    }

    /// Reset the fence to unsignaled state.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.ctx.device().reset_fences(&[self.fence])?;
        }
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::GpuContextBuilder;

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn signaled_fence_waits_immediately() {
        let ctx = GpuContextBuilder::new().validation(false).build().unwrap();
        let fence = ctx.create_fence(true).unwrap();
        assert!(fence.wait(0).unwrap());
        fence.reset().unwrap();
        assert!(!fence.wait(0).unwrap());
    }
}
