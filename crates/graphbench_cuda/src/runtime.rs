use std::{
    ffi::CString,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use cudarc::{
    driver::{CudaContext, CudaSlice, CudaStream, DevicePtr, DriverError, sys},
    nvrtc::compile_ptx,
};
use graphbench::{
    args::{KernelArg, check_signature},
    graph::{Node, NodeIndex, TaskGraph, Topology},
    kernel::{KernelOp, Task, window},
    metrics::ELEMENT_SIZE,
    runtime::{BufferId, Runtime, RuntimeError, UpdateMode, UpdateOutcome},
};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::{
    graph::{CudaGraphExecHandle, CudaGraphHandle, DeviceFunction, DeviceModule, KernelParams},
    kernels::{KERNELS, entry_points},
};

fn driver(op: &'static str) -> impl FnOnce(DriverError) -> RuntimeError {
    move |e| RuntimeError::driver(op, format!("{e:?}"))
}

/// A CUDA device. Queues are driver streams, plans are instantiated CUDA
/// graphs.
pub struct CudaRuntime {
    ctx: Arc<CudaContext>,
    /// Stream used for host transfers.
    copy_stream: Arc<CudaStream>,
    functions: FxHashMap<KernelOp, DeviceFunction>,
    buffers: RwLock<FxHashMap<BufferId, CudaSlice<f64>>>,
    next_buffer: AtomicU64,
    /// Owns the code behind `functions`.
    _module: DeviceModule,
}

impl CudaRuntime {
    #[tracing::instrument]
    pub fn new(ordinal: usize) -> Result<Self, RuntimeError> {
        let ctx = CudaContext::new(ordinal).map_err(driver("cuCtxCreate"))?;
        // Buffers are shared across streams; ordering comes from explicit
        // synchronization and graph edges only.
        unsafe { ctx.disable_event_tracking() };
        let ptx = compile_ptx(KERNELS).map_err(|e| RuntimeError::Compile(format!("{e:?}")))?;
        let image = CString::new(ptx.to_src()).map_err(|e| RuntimeError::Compile(e.to_string()))?;
        let module = DeviceModule::load(ctx.clone(), image).map_err(driver("cuModuleLoadData"))?;
        let functions = entry_points()
            .map(|(op, name)| Ok((op, module.function(name).map_err(driver("cuModuleGetFunction"))?)))
            .collect::<Result<FxHashMap<_, _>, RuntimeError>>()?;
        info!(ordinal, "cuda runtime ready");
        Ok(Self {
            copy_stream: ctx.default_stream(),
            ctx,
            functions,
            buffers: RwLock::default(),
            next_buffer: AtomicU64::new(0),
            _module: module,
        })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    fn function(&self, op: KernelOp) -> Result<DeviceFunction, RuntimeError> {
        self.functions
            .get(&op)
            .copied()
            .ok_or(RuntimeError::MalformedArgs(op))
    }

    /// Encode a task's arguments into parameter slots, resolving its buffer
    /// to a device address.
    fn kernel_params(&self, task: &Task) -> Result<KernelParams, RuntimeError> {
        check_signature(&task.args, task.op.signature())
            .map_err(|_| RuntimeError::MalformedArgs(task.op))?;
        let (buffer, offset, count) =
            window(&task.args).ok_or(RuntimeError::MalformedArgs(task.op))?;
        let buffers = self.buffers.read().unwrap_or_else(PoisonError::into_inner);
        let slice = buffers
            .get(&buffer)
            .ok_or(RuntimeError::UnknownBuffer(buffer))?;
        let end = offset + count;
        if end > slice.len() {
            return Err(RuntimeError::OutOfRange {
                buffer,
                offset,
                end,
                len: slice.len(),
            });
        }
        let (base, _record) = slice.device_ptr(&self.copy_stream);
        let values = task
            .args
            .iter()
            .map(|arg| match arg {
                KernelArg::Buffer { offset, .. } => base + (offset * ELEMENT_SIZE) as u64,
                scalar => scalar.scalar_bits().unwrap_or_default(),
            })
            .collect();
        Ok(KernelParams::new(values))
    }

    /// Mirror a host-side graph node for node, preserving every edge.
    fn build_graph(&self, graph: &TaskGraph) -> Result<(CudaGraphHandle, Vec<KernelParams>), RuntimeError> {
        let mut handle = CudaGraphHandle::new(self.ctx.clone()).map_err(driver("cuGraphCreate"))?;
        let mut nodes: FxHashMap<NodeIndex, sys::CUgraphNode> = FxHashMap::default();
        let mut params = Vec::with_capacity(graph.task_count());
        for idx in graph.execution_order() {
            let deps = graph
                .predecessors(idx)
                .iter()
                .map(|p| nodes.get(p).copied())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| RuntimeError::driver("cuGraphAddNode", "dependency added out of order"))?;
            let node = match graph.node(idx) {
                Node::Barrier(_) => handle.add_empty_node(&deps).map_err(driver("cuGraphAddEmptyNode"))?,
                Node::Task(t) => {
                    let func = self.function(t.task.op)?;
                    let mut p = self.kernel_params(&t.task)?;
                    let launch = t.task.launch;
                    let node = unsafe {
                        handle.add_kernel_node(
                            &deps,
                            func.raw(),
                            (launch.grid, 1, 1),
                            (launch.block, 1, 1),
                            p.as_cuda_params(),
                        )
                    }
                    .map_err(driver("cuGraphAddKernelNode"))?;
                    params.push(p);
                    node
                }
            };
            nodes.insert(idx, node);
        }
        Ok((handle, params))
    }
}

/// An instantiated CUDA graph together with the graph it came from.
pub struct CudaPlan {
    exec: CudaGraphExecHandle,
    _graph: CudaGraphHandle,
    params: Vec<KernelParams>,
    topology: Topology,
}

impl CudaPlan {
    pub fn kernel_count(&self) -> usize {
        self.params.len()
    }
}

impl Runtime for CudaRuntime {
    type Queue = Arc<CudaStream>;
    type Plan = CudaPlan;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn alloc(&self, len: usize) -> Result<BufferId, RuntimeError> {
        let slice = self
            .copy_stream
            .alloc_zeros::<f64>(len)
            .map_err(|e| RuntimeError::Alloc {
                len,
                reason: format!("{e:?}"),
            })?;
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slice);
        Ok(id)
    }

    fn free(&self, buffer: BufferId) -> Result<(), RuntimeError> {
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&buffer)
            .map(drop)
            .ok_or(RuntimeError::UnknownBuffer(buffer))
    }

    fn write(&self, buffer: BufferId, data: &[f64]) -> Result<(), RuntimeError> {
        let mut buffers = self.buffers.write().unwrap_or_else(PoisonError::into_inner);
        let slice = buffers
            .get_mut(&buffer)
            .ok_or(RuntimeError::UnknownBuffer(buffer))?;
        if slice.len() != data.len() {
            return Err(RuntimeError::SizeMismatch {
                buffer,
                len: slice.len(),
                got: data.len(),
            });
        }
        self.copy_stream
            .memcpy_htod(data, slice)
            .map_err(driver("cuMemcpyHtoD"))?;
        self.copy_stream.synchronize().map_err(driver("cuStreamSynchronize"))
    }

    fn read(&self, buffer: BufferId) -> Result<Vec<f64>, RuntimeError> {
        let buffers = self.buffers.read().unwrap_or_else(PoisonError::into_inner);
        let slice = buffers
            .get(&buffer)
            .ok_or(RuntimeError::UnknownBuffer(buffer))?;
        let data = self
            .copy_stream
            .memcpy_dtov(slice)
            .map_err(driver("cuMemcpyDtoH"))?;
        self.copy_stream
            .synchronize()
            .map_err(driver("cuStreamSynchronize"))?;
        Ok(data)
    }

    fn synchronize(&self) -> Result<(), RuntimeError> {
        self.ctx.synchronize().map_err(driver("cuCtxSynchronize"))
    }

    fn create_queue(&self) -> Result<Self::Queue, RuntimeError> {
        self.ctx.new_stream().map_err(driver("cuStreamCreate"))
    }

    fn synchronize_queue(&self, queue: &Self::Queue) -> Result<(), RuntimeError> {
        queue.synchronize().map_err(driver("cuStreamSynchronize"))
    }

    fn launch(&self, queue: &Self::Queue, task: &Task) -> Result<(), RuntimeError> {
        let func = self.function(task.op)?;
        let mut params = self.kernel_params(task)?;
        self.ctx.bind_to_thread().map_err(driver("cuCtxSetCurrent"))?;
        // Parameter values are copied at launch time.
        unsafe {
            sys::cuLaunchKernel(
                func.raw(),
                task.launch.grid,
                1,
                1,
                task.launch.block,
                1,
                1,
                0,
                queue.cu_stream(),
                params.as_cuda_params(),
                std::ptr::null_mut(),
            )
            .result()
        }
        .map_err(driver("cuLaunchKernel"))
    }

    #[tracing::instrument(skip_all, fields(nodes = graph.node_count()))]
    fn instantiate(&self, graph: &TaskGraph) -> Result<Self::Plan, RuntimeError> {
        let (handle, params) = self.build_graph(graph)?;
        let exec = handle.instantiate().map_err(driver("cuGraphInstantiate"))?;
        Ok(CudaPlan {
            exec,
            _graph: handle,
            params,
            topology: graph.topology(),
        })
    }

    fn update(
        &self,
        plan: &mut Self::Plan,
        graph: &TaskGraph,
        mode: UpdateMode,
    ) -> Result<UpdateOutcome, RuntimeError> {
        match mode {
            UpdateMode::Diff => {
                let topology = graph.topology();
                if topology != plan.topology {
                    return Ok(UpdateOutcome::TopologyChanged);
                }
                let (handle, params) = self.build_graph(graph)?;
                if !plan.exec.update(&handle).map_err(driver("cuGraphExecUpdate"))? {
                    return Ok(UpdateOutcome::TopologyChanged);
                }
                plan._graph = handle;
                plan.params = params;
                Ok(UpdateOutcome::Applied)
            }
            UpdateMode::Replace => {
                debug!(nodes = graph.node_count(), "re-instantiating plan");
                *plan = self.instantiate(graph)?;
                Ok(UpdateOutcome::Replaced)
            }
        }
    }

    fn launch_plan(&self, plan: &Self::Plan, queue: &Self::Queue) -> Result<(), RuntimeError> {
        plan.exec.launch(queue).map_err(driver("cuGraphLaunch"))
    }
}
