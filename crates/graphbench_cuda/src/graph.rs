//! Thin wrappers over the CUDA graph driver API.
//!
//! cudarc only exposes graphs through stream capture, which gives no handle
//! on individual nodes or on `cuGraphExecUpdate`. These types own the raw
//! handles instead so that graphs can be built node by node with explicit
//! dependencies and diff-updated in place.

use std::ffi::{CString, c_void};
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{
    CudaContext, CudaStream, DriverError,
    sys::{self, CUfunction, CUgraph, CUgraphExec, CUgraphNode, CUmodule},
};

/// A CUDA graph under construction.
pub struct CudaGraphHandle {
    pub(crate) cu_graph: CUgraph,
    pub(crate) ctx: Arc<CudaContext>,
}

// Driver handles may be used from any thread once the context is bound.
unsafe impl Send for CudaGraphHandle {}

impl CudaGraphHandle {
    pub fn new(ctx: Arc<CudaContext>) -> Result<Self, DriverError> {
        ctx.bind_to_thread()?;
        let mut graph = MaybeUninit::uninit();
        unsafe {
            sys::cuGraphCreate(graph.as_mut_ptr(), 0).result()?;
            Ok(Self {
                cu_graph: graph.assume_init(),
                ctx,
            })
        }
    }

    /// Adds a node that does no work and completes once all of
    /// `dependencies` have.
    pub fn add_empty_node(&mut self, dependencies: &[CUgraphNode]) -> Result<CUgraphNode, DriverError> {
        self.ctx.bind_to_thread()?;
        let mut node = MaybeUninit::uninit();
        unsafe {
            sys::cuGraphAddEmptyNode(
                node.as_mut_ptr(),
                self.cu_graph,
                dependencies.as_ptr(),
                dependencies.len(),
            )
            .result()?;
            Ok(node.assume_init())
        }
    }

    /// Adds a kernel node running after `dependencies`.
    ///
    /// # Safety
    /// `kernel_params` must point at one valid pointer per kernel parameter,
    /// each addressing a value of that parameter's size.
    pub unsafe fn add_kernel_node(
        &mut self,
        dependencies: &[CUgraphNode],
        func: CUfunction,
        grid_dim: (u32, u32, u32),
        block_dim: (u32, u32, u32),
        kernel_params: *mut *mut c_void,
    ) -> Result<CUgraphNode, DriverError> {
        self.ctx.bind_to_thread()?;
        let params = sys::CUDA_KERNEL_NODE_PARAMS {
            func,
            gridDimX: grid_dim.0,
            gridDimY: grid_dim.1,
            gridDimZ: grid_dim.2,
            blockDimX: block_dim.0,
            blockDimY: block_dim.1,
            blockDimZ: block_dim.2,
            sharedMemBytes: 0,
            kernelParams: kernel_params,
            extra: std::ptr::null_mut(),
            kern: std::ptr::null_mut(),
            ctx: std::ptr::null_mut(),
        };
        let mut node = MaybeUninit::uninit();
        unsafe {
            sys::cuGraphAddKernelNode_v2(
                node.as_mut_ptr(),
                self.cu_graph,
                dependencies.as_ptr(),
                dependencies.len(),
                &params,
            )
            .result()?;
            Ok(node.assume_init())
        }
    }

    pub fn instantiate(&self) -> Result<CudaGraphExecHandle, DriverError> {
        self.ctx.bind_to_thread()?;
        let mut graph_exec = MaybeUninit::uninit();
        unsafe {
            sys::cuGraphInstantiateWithFlags(graph_exec.as_mut_ptr(), self.cu_graph, 0).result()?;
            Ok(CudaGraphExecHandle {
                cu_graph_exec: graph_exec.assume_init(),
                ctx: self.ctx.clone(),
            })
        }
    }
}

impl Drop for CudaGraphHandle {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        if !self.cu_graph.is_null() {
            unsafe {
                let _ = sys::cuGraphDestroy(self.cu_graph);
            }
        }
    }
}

/// An instantiated graph that can be launched and diff-updated.
pub struct CudaGraphExecHandle {
    pub(crate) cu_graph_exec: CUgraphExec,
    pub(crate) ctx: Arc<CudaContext>,
}

unsafe impl Send for CudaGraphExecHandle {}

impl CudaGraphExecHandle {
    pub fn launch(&self, stream: &CudaStream) -> Result<(), DriverError> {
        self.ctx.bind_to_thread()?;
        unsafe { sys::cuGraphLaunch(self.cu_graph_exec, stream.cu_stream()).result() }
    }

    /// Patch this executable with the node parameters of `graph`.
    ///
    /// Returns `Ok(false)` when the driver refuses the update, which leaves
    /// the executable untouched.
    pub fn update(&mut self, graph: &CudaGraphHandle) -> Result<bool, DriverError> {
        self.ctx.bind_to_thread()?;
        let mut info = MaybeUninit::<sys::CUgraphExecUpdateResultInfo>::zeroed();
        let status =
            unsafe { sys::cuGraphExecUpdate_v2(self.cu_graph_exec, graph.cu_graph, info.as_mut_ptr()) };
        match status {
            sys::cudaError_enum::CUDA_SUCCESS => Ok(true),
            sys::cudaError_enum::CUDA_ERROR_GRAPH_EXEC_UPDATE_FAILURE => {
                let info = unsafe { info.assume_init() };
                tracing::debug!(result = ?info.result, "graph exec update refused");
                Ok(false)
            }
            err => Err(DriverError(err)),
        }
    }
}

impl Drop for CudaGraphExecHandle {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        if !self.cu_graph_exec.is_null() {
            unsafe {
                let _ = sys::cuGraphExecDestroy(self.cu_graph_exec);
            }
        }
    }
}

/// A loaded PTX module.
///
/// Loaded through the driver directly so raw `CUfunction` handles can be
/// placed into graph kernel nodes.
pub struct DeviceModule {
    cu_module: CUmodule,
    ctx: Arc<CudaContext>,
}

unsafe impl Send for DeviceModule {}
unsafe impl Sync for DeviceModule {}

impl DeviceModule {
    /// Load PTX source text. The text must not contain interior NULs.
    pub fn load(ctx: Arc<CudaContext>, ptx: CString) -> Result<Self, DriverError> {
        ctx.bind_to_thread()?;
        let mut module = MaybeUninit::uninit();
        unsafe {
            sys::cuModuleLoadData(module.as_mut_ptr(), ptx.as_ptr() as *const c_void).result()?;
            Ok(Self {
                cu_module: module.assume_init(),
                ctx,
            })
        }
    }

    pub fn function(&self, name: &str) -> Result<DeviceFunction, DriverError> {
        self.ctx.bind_to_thread()?;
        let name = CString::new(name).map_err(|_| DriverError(sys::cudaError_enum::CUDA_ERROR_INVALID_VALUE))?;
        let mut func = MaybeUninit::uninit();
        unsafe {
            sys::cuModuleGetFunction(func.as_mut_ptr(), self.cu_module, name.as_ptr()).result()?;
            Ok(DeviceFunction(func.assume_init()))
        }
    }
}

impl Drop for DeviceModule {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        if !self.cu_module.is_null() {
            unsafe {
                let _ = sys::cuModuleUnload(self.cu_module);
            }
        }
    }
}

/// Raw kernel handle. Valid for as long as its [`DeviceModule`] is loaded.
#[derive(Debug, Clone, Copy)]
pub struct DeviceFunction(pub(crate) CUfunction);

unsafe impl Send for DeviceFunction {}
unsafe impl Sync for DeviceFunction {}

impl DeviceFunction {
    pub fn raw(&self) -> CUfunction {
        self.0
    }
}

/// Kernel parameter storage, one 8-byte slot per parameter.
///
/// The driver reads parameters through an array of pointers, so the values
/// live in a boxed slice that never moves while the pointers are alive.
pub struct KernelParams {
    values: Box<[u64]>,
    ptrs: Box<[*mut c_void]>,
}

unsafe impl Send for KernelParams {}

impl KernelParams {
    pub fn new(values: Vec<u64>) -> Self {
        let values = values.into_boxed_slice();
        let ptrs = values
            .iter()
            .map(|v| v as *const u64 as *mut c_void)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { values, ptrs }
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Returns the pointer array that CUDA expects.
    pub fn as_cuda_params(&mut self) -> *mut *mut c_void {
        self.ptrs.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_point_at_values() {
        let mut params = KernelParams::new(vec![0x1000, 7, 2.5f64.to_bits()]);
        let ptrs = params.as_cuda_params();
        assert!(!ptrs.is_null());
        for (i, v) in params.values().to_vec().into_iter().enumerate() {
            assert_eq!(unsafe { *(*ptrs.add(i) as *const u64) }, v);
        }
    }

    #[test]
    fn empty_graph_instantiates() {
        // Skip if no CUDA device
        let ctx = match CudaContext::new(0) {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        let mut graph = CudaGraphHandle::new(ctx.clone()).unwrap();
        let a = graph.add_empty_node(&[]).unwrap();
        graph.add_empty_node(&[a]).unwrap();
        let exec = graph.instantiate().unwrap();
        let stream = ctx.new_stream().unwrap();
        exec.launch(&stream).unwrap();
        stream.synchronize().unwrap();
    }

    #[test]
    fn update_refuses_new_topology() {
        let ctx = match CudaContext::new(0) {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        let mut one = CudaGraphHandle::new(ctx.clone()).unwrap();
        one.add_empty_node(&[]).unwrap();
        let mut exec = one.instantiate().unwrap();

        let mut same = CudaGraphHandle::new(ctx.clone()).unwrap();
        same.add_empty_node(&[]).unwrap();
        assert!(exec.update(&same).unwrap());

        let mut two = CudaGraphHandle::new(ctx).unwrap();
        let a = two.add_empty_node(&[]).unwrap();
        two.add_empty_node(&[a]).unwrap();
        assert!(!exec.update(&two).unwrap());
    }
}
