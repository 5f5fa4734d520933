//! GPU timestamp timer.

use crate::command::CommandBuffer;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;

/// Measures device time between two points of a command buffer.
///
/// Results read before both timestamps have executed are `0.0`.
pub struct GpuTimer {
    ctx: GpuContext,
    pool: vk::QueryPool,
    timestamp_period: f32,
}

impl GpuTimer {
    pub(crate) fn new(ctx: GpuContext) -> Result<Self> {
        if !ctx.capabilities().supports_timestamps {
            return Err(GpuError::ExtensionNotSupported(
                "timestamp queries on graphics and compute queues".to_string(),
            ));
        }

        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2);
        let pool = unsafe { ctx.device().create_query_pool(&create_info, None)? };
        unsafe { ctx.device().reset_query_pool(pool, 0, 2) };

        let timestamp_period = ctx.capabilities().timestamp_period;
        Ok(Self {
            ctx,
            pool,
            timestamp_period,
        })
    }

    /// Record the start timestamp.
    pub fn start(&self, cmd: &CommandBuffer) {
        unsafe {
            let device = self.ctx.device();
            device.cmd_reset_query_pool(cmd.raw(), self.pool, 0, 2);
            device.cmd_write_timestamp2(
                cmd.raw(),
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                self.pool,
                0,
            );
        }
    }

    /// Record the stop timestamp.
    pub fn stop(&self, cmd: &CommandBuffer) {
        unsafe {
            self.ctx.device().cmd_write_timestamp2(
                cmd.raw(),
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                self.pool,
                1,
            );
        }
    }

    /// Elapsed device time in nanoseconds, or `0.0` if not available yet.
    pub fn elapsed_ns(&self) -> Result<f64> {
        let mut timestamps = [0u64; 2];
        let result = unsafe {
            self.ctx.device().get_query_pool_results(
                self.pool,
                0,
                &mut timestamps,
                vk::QueryResultFlags::TYPE_64,
            )
        };

        match result {
            Ok(()) => Ok(ticks_to_ns(
                timestamps[0],
                timestamps[1],
                self.timestamp_period,
            )),
            Err(vk::Result::NOT_READY) => Ok(0.0),
            Err(e) => Err(e.into()),
        }
    }

    /// Elapsed device time in milliseconds, or `0.0` if not available yet.
    pub fn elapsed_ms(&self) -> Result<f64> {
        Ok(self.elapsed_ns()? / 1_000_000.0)
    }
}

impl Drop for GpuTimer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_query_pool(self.pool, None);
        }
    }
}

fn ticks_to_ns(start: u64, end: u64, period: f32) -> f64 {
    end.saturating_sub(start) as f64 * f64::from(period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ticks_scale_by_period() {
        assert_relative_eq!(ticks_to_ns(100, 350, 1.0), 250.0);
        assert_relative_eq!(ticks_to_ns(0, 1000, 0.5), 500.0);
    }

    #[test]
    fn reversed_timestamps_read_as_zero() {
        assert_relative_eq!(ticks_to_ns(500, 100, 1.0), 0.0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn unsubmitted_timer_reads_zero() {
        let ctx = crate::GpuContextBuilder::new()
            .validation(false)
            .build()
            .unwrap();
        let timer = ctx.create_timer().unwrap();
        assert_relative_eq!(timer.elapsed_ms().unwrap(), 0.0);
    }
}
