//! Direct per-call dispatch into independent queues, without a graph.
//!
//! Each of `slots` streams issues `kernels_per_slot` launches back to back
//! on its own queue. Within a queue launches run in issue order; across
//! queues nothing is ordered until the device-wide synchronize that closes
//! every epoch.

use std::time::Instant;

use rayon::{
    ThreadPool, ThreadPoolBuilder,
    iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator},
};
use tracing::{debug, trace};

use crate::{
    bench::BenchError,
    chunk::chunk,
    kernel::Kernel,
    metrics::Timings,
    params::Params,
    runtime::{Runtime, RuntimeError},
};

pub struct StreamDispatcher<'rt, R: Runtime> {
    runtime: &'rt R,
    params: Params,
    kernel: Kernel,
    queues: Vec<R::Queue>,
    /// One worker per stream when dispatching from multiple host threads.
    pool: Option<ThreadPool>,
}

impl<'rt, R: Runtime> StreamDispatcher<'rt, R> {
    pub fn new(
        runtime: &'rt R,
        params: &Params,
        kernel: &Kernel,
        multithreaded: bool,
    ) -> Result<Self, BenchError> {
        let queues = (0..params.slots())
            .map(|_| runtime.create_queue())
            .collect::<Result<Vec<_>, _>>()?;
        let pool = if multithreaded {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(params.slots())
                    .thread_name(|i| format!("dispatch-{i}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self {
            runtime,
            params: *params,
            kernel: kernel.clone(),
            queues,
            pool,
        })
    }

    pub fn streams(&self) -> usize {
        self.queues.len()
    }

    /// Issue stream `stream`'s launch sequence for one epoch.
    fn dispatch_stream(&self, stream: usize) -> Result<(), RuntimeError> {
        let per_stream = self.params.kernels_per_slot();
        let n_tasks = self.params.tasks_per_epoch();
        let queue = &self.queues[stream];
        for k in 0..per_stream {
            let chunk = chunk(
                stream * per_stream + k,
                n_tasks,
                self.params.elements_per_kernel(),
                self.params.total_elements(),
            );
            trace!(stream, k, offset = chunk.offset, width = chunk.width, "dispatch");
            self.runtime
                .launch(queue, &self.kernel.task(chunk, self.params.launch_width()))?;
        }
        Ok(())
    }

    /// Issue every stream's sequence once.
    pub fn dispatch_epoch(&self) -> Result<(), RuntimeError> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                (0..self.streams())
                    .into_par_iter()
                    .with_max_len(1)
                    .try_for_each(|s| self.dispatch_stream(s))
            }),
            None => (0..self.streams()).try_for_each(|s| self.dispatch_stream(s)),
        }
    }

    /// Time `repetitions` rounds of `epochs` synchronized epochs.
    pub fn run(&self) -> Result<Timings, BenchError> {
        let mut timings = Timings::with_capacity(self.params.repetitions());
        self.runtime.synchronize()?;
        for rep in 0..self.params.repetitions() {
            let start = Instant::now();
            for _ in 0..self.params.epochs() {
                self.dispatch_epoch()?;
                self.runtime.synchronize()?;
            }
            let elapsed = start.elapsed();
            debug!(
                rep,
                elapsed_us = elapsed.as_secs_f64() * 1e6,
                threaded = self.pool.is_some(),
                "repetition"
            );
            timings.record(elapsed);
        }
        Ok(timings)
    }
}
