//! In-process accelerator.
//!
//! Device memory is host memory, and every queue is a worker thread draining
//! a FIFO of jobs. Launches return as soon as the job is enqueued; errors
//! raised while a job runs are held by the queue and reported by the next
//! synchronize, like an asynchronous device fault.

use std::{
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Sender},
    },
    thread::JoinHandle,
};

use crossbeam_utils::sync::WaitGroup;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    args::check_signature,
    graph::{TaskGraph, Topology},
    kernel::{Task, window},
    runtime::{BufferId, Runtime, RuntimeError, UpdateMode, UpdateOutcome},
};

type DeviceMemory = Arc<Mutex<Vec<f64>>>;
type Job = Box<dyn FnOnce() + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct NativeRuntime {
    buffers: RwLock<FxHashMap<BufferId, DeviceMemory>>,
    queues: Mutex<Vec<Weak<QueueState>>>,
    next_buffer: AtomicU64,
    next_queue: AtomicUsize,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn memory(&self, buffer: BufferId) -> Result<DeviceMemory, RuntimeError> {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&buffer)
            .cloned()
            .ok_or(RuntimeError::UnknownBuffer(buffer))
    }

    /// Validate a task against the buffer it addresses.
    fn resolve(&self, task: &Task) -> Result<Step, RuntimeError> {
        check_signature(&task.args, task.op.signature())
            .map_err(|_| RuntimeError::MalformedArgs(task.op))?;
        let (buffer, offset, count) =
            window(&task.args).ok_or(RuntimeError::MalformedArgs(task.op))?;
        let memory = self.memory(buffer)?;
        let len = lock(&memory).len();
        let end = offset + count;
        if end > len {
            return Err(RuntimeError::OutOfRange {
                buffer,
                offset,
                end,
                len,
            });
        }
        Ok(Step {
            task: task.clone(),
            memory,
            range: offset..end,
        })
    }
}

/// A task with its buffer resolved, ready to run on a queue worker.
struct Step {
    task: Task,
    memory: DeviceMemory,
    range: Range<usize>,
}

impl Step {
    fn run(&self) {
        let mut data = lock(&self.memory);
        self.task
            .op
            .apply(&self.task.args, &mut data[self.range.clone()]);
    }
}

struct QueueState {
    id: usize,
    /// Each enqueued job holds a clone until it has run.
    inflight: Mutex<WaitGroup>,
    fault: Mutex<Option<RuntimeError>>,
}

impl QueueState {
    /// Block until every job enqueued so far has run, then report the first
    /// fault among them.
    fn wait_idle(&self) -> Result<(), RuntimeError> {
        let inflight = std::mem::take(&mut *lock(&self.inflight));
        inflight.wait();
        match lock(&self.fault).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A FIFO queue served by one worker thread. Dropping it drains outstanding
/// work and joins the worker.
pub struct NativeQueue {
    state: Arc<QueueState>,
    sender: Option<Sender<(Job, WaitGroup)>>,
    worker: Option<JoinHandle<()>>,
}

impl NativeQueue {
    fn spawn(id: usize) -> Result<Self, RuntimeError> {
        let state = Arc::new(QueueState {
            id,
            inflight: Mutex::default(),
            fault: Mutex::new(None),
        });
        let (sender, receiver) = mpsc::channel::<(Job, WaitGroup)>();
        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name(format!("native-queue-{id}"))
            .spawn(move || {
                for (job, ticket) in receiver {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        lock(&worker_state.fault)
                            .get_or_insert(RuntimeError::driver("kernel", "task panicked on device"));
                    }
                    drop(ticket);
                }
            })
            .map_err(|e| RuntimeError::driver("queue create", e))?;
        Ok(Self {
            state,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> usize {
        self.state.id
    }

    fn enqueue(&self, job: Job) -> Result<(), RuntimeError> {
        let ticket = lock(&self.state.inflight).clone();
        match &self.sender {
            Some(sender) if sender.send((job, ticket)).is_ok() => Ok(()),
            _ => Err(RuntimeError::QueueLost(self.state.id)),
        }
    }
}

impl Drop for NativeQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// An instantiated graph: its tasks resolved and flattened into execution
/// order.
pub struct NativePlan {
    steps: Arc<Vec<Step>>,
    topology: Topology,
}

impl NativePlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Runtime for NativeRuntime {
    type Queue = NativeQueue;
    type Plan = NativePlan;

    fn name(&self) -> &'static str {
        "native"
    }

    fn alloc(&self, len: usize) -> Result<BufferId, RuntimeError> {
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| RuntimeError::Alloc {
                len,
                reason: e.to_string(),
            })?;
        data.resize(len, 0.0);
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(data)));
        Ok(id)
    }

    fn free(&self, buffer: BufferId) -> Result<(), RuntimeError> {
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&buffer)
            .map(|_| ())
            .ok_or(RuntimeError::UnknownBuffer(buffer))
    }

    fn write(&self, buffer: BufferId, data: &[f64]) -> Result<(), RuntimeError> {
        let memory = self.memory(buffer)?;
        let mut dst = lock(&memory);
        if dst.len() != data.len() {
            return Err(RuntimeError::SizeMismatch {
                buffer,
                len: dst.len(),
                got: data.len(),
            });
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read(&self, buffer: BufferId) -> Result<Vec<f64>, RuntimeError> {
        let memory = self.memory(buffer)?;
        let data = lock(&memory).clone();
        Ok(data)
    }

    fn synchronize(&self) -> Result<(), RuntimeError> {
        let live = {
            let mut queues = lock(&self.queues);
            queues.retain(|q| q.strong_count() > 0);
            queues.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };
        let mut first = None;
        for queue in live {
            if let Err(err) = queue.wait_idle() {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn create_queue(&self) -> Result<NativeQueue, RuntimeError> {
        let queue = NativeQueue::spawn(self.next_queue.fetch_add(1, Ordering::Relaxed))?;
        lock(&self.queues).push(Arc::downgrade(&queue.state));
        Ok(queue)
    }

    fn synchronize_queue(&self, queue: &NativeQueue) -> Result<(), RuntimeError> {
        queue.state.wait_idle()
    }

    fn launch(&self, queue: &NativeQueue, task: &Task) -> Result<(), RuntimeError> {
        let step = self.resolve(task)?;
        trace!(queue = queue.id(), op = ?task.op, range = ?step.range, "launch");
        queue.enqueue(Box::new(move || step.run()))
    }

    #[tracing::instrument(skip_all, fields(nodes = graph.node_count()))]
    fn instantiate(&self, graph: &TaskGraph) -> Result<NativePlan, RuntimeError> {
        let steps = graph
            .tasks()
            .map(|(_, node)| self.resolve(&node.task))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NativePlan {
            steps: Arc::new(steps),
            topology: graph.topology(),
        })
    }

    fn update(
        &self,
        plan: &mut NativePlan,
        graph: &TaskGraph,
        mode: UpdateMode,
    ) -> Result<UpdateOutcome, RuntimeError> {
        match mode {
            UpdateMode::Diff => {
                let topology = graph.topology();
                if topology != plan.topology {
                    return Ok(UpdateOutcome::TopologyChanged);
                }
                let steps = graph
                    .tasks()
                    .map(|(_, node)| self.resolve(&node.task))
                    .collect::<Result<Vec<_>, _>>()?;
                // Launches already enqueued keep the steps they captured.
                plan.steps = Arc::new(steps);
                Ok(UpdateOutcome::Applied)
            }
            UpdateMode::Replace => {
                *plan = self.instantiate(graph)?;
                Ok(UpdateOutcome::Replaced)
            }
        }
    }

    fn launch_plan(&self, plan: &NativePlan, queue: &NativeQueue) -> Result<(), RuntimeError> {
        let steps = plan.steps.clone();
        queue.enqueue(Box::new(move || {
            for step in steps.iter() {
                step.run();
            }
        }))
    }
}
