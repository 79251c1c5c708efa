use serde::Serialize;
use thiserror::Error;

/// Error returned when a [`Params`] cannot describe a runnable benchmark.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{slots} slots x {kernels_per_slot} kernels per slot overflows the task index space")]
    TooManyTasks { slots: usize, kernels_per_slot: usize },
}

/// Problem size and graph shape of one benchmark run.
///
/// Built once through [`Params::new`] and never mutated afterwards. The
/// per-task width is `total_elements / (slots * kernels_per_slot)`; the last
/// task of each epoch absorbs whatever that division leaves over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Params {
    epochs: usize,
    slots: usize,
    kernels_per_slot: usize,
    repetitions: usize,
    total_elements: usize,
    elements_per_kernel: usize,
    launch_width: u32,
    grid_size: u32,
}

impl Params {
    pub fn new(
        epochs: usize,
        slots: usize,
        kernels_per_slot: usize,
        repetitions: usize,
        total_elements: usize,
        launch_width: u32,
    ) -> Result<Self, ParamsError> {
        if slots == 0 {
            return Err(ParamsError::Zero("slots"));
        }
        if kernels_per_slot == 0 {
            return Err(ParamsError::Zero("kernels_per_slot"));
        }
        if repetitions == 0 {
            return Err(ParamsError::Zero("repetitions"));
        }
        if total_elements == 0 {
            return Err(ParamsError::Zero("total_elements"));
        }
        if launch_width == 0 {
            return Err(ParamsError::Zero("launch_width"));
        }
        let tasks = slots
            .checked_mul(kernels_per_slot)
            .ok_or(ParamsError::TooManyTasks {
                slots,
                kernels_per_slot,
            })?;
        let elements_per_kernel = total_elements / tasks;
        Ok(Self {
            epochs,
            slots,
            kernels_per_slot,
            repetitions,
            total_elements,
            elements_per_kernel,
            launch_width,
            grid_size: grid_for(elements_per_kernel, launch_width),
        })
    }

    /// The same shape restricted to a single epoch, used by split replay.
    pub fn single_epoch(&self) -> Self {
        Self { epochs: 1, ..*self }
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn kernels_per_slot(&self) -> usize {
        self.kernels_per_slot
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    pub fn total_elements(&self) -> usize {
        self.total_elements
    }

    pub fn elements_per_kernel(&self) -> usize {
        self.elements_per_kernel
    }

    pub fn launch_width(&self) -> u32 {
        self.launch_width
    }

    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// Task nodes per epoch.
    pub fn tasks_per_epoch(&self) -> usize {
        self.slots * self.kernels_per_slot
    }
}

/// Number of blocks of `launch_width` threads needed to cover `width`
/// elements. Never less than one block so that an empty chunk still yields a
/// valid launch.
pub fn grid_for(width: usize, launch_width: u32) -> u32 {
    let blocks = width.div_ceil(launch_width as usize).max(1);
    u32::try_from(blocks).unwrap_or(u32::MAX)
}
