//! GPU range timers bracketing groups of passes.

use std::sync::Arc;

use ember_gpu::{RangeTimer, do_in_batch};

use crate::args::RenderContext;
use crate::task::{Job, Varying};

/// Averages read back from a range timer, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuTimings {
    pub gpu: f64,
    pub batch: f64,
}

/// Opens the range of a timer owned by this job and hands the timer to the
/// matching [`EndGpuRangeTimer`].
pub struct BeginGpuRangeTimer {
    timer: Arc<RangeTimer>,
    output: Varying<Arc<RangeTimer>>,
}

impl BeginGpuRangeTimer {
    #[must_use]
    pub fn new(name: &str, output: Varying<Arc<RangeTimer>>) -> Self {
        Self {
            timer: RangeTimer::new(name),
            output,
        }
    }
}

impl Job for BeginGpuRangeTimer {
    fn run(&mut self, ctx: &mut RenderContext) {
        self.output.set(self.timer.clone());
        do_in_batch("BeginGPURangeTimer", &ctx.context, |batch| {
            self.timer.begin(batch);
        });
    }
}

/// Closes the range opened by [`BeginGpuRangeTimer`].
pub struct EndGpuRangeTimer {
    input: Varying<Arc<RangeTimer>>,
    timings: Varying<GpuTimings>,
}

impl EndGpuRangeTimer {
    #[must_use]
    pub fn new(input: Varying<Arc<RangeTimer>>, timings: Varying<GpuTimings>) -> Self {
        Self { input, timings }
    }
}

impl Job for EndGpuRangeTimer {
    fn run(&mut self, ctx: &mut RenderContext) {
        let Some(timer) = self.input.take() else {
            log::debug!("EndGpuRangeTimer: no open range");
            return;
        };
        do_in_batch("EndGPURangeTimer", &ctx.context, |batch| {
            timer.end(batch);
        });
        self.timings.set(GpuTimings {
            gpu: timer.gpu_elapsed_average(),
            batch: timer.batch_elapsed_average(),
        });
    }
}
