//! Mapping from a linear task index to its window of the shared buffer.

use serde::Serialize;

/// Contiguous element range `[offset, offset + width)` owned by one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Chunk {
    pub offset: usize,
    pub width: usize,
}

impl Chunk {
    pub fn end(&self) -> usize {
        self.offset + self.width
    }
}

/// Chunk of task `index` out of `n_tasks` tasks of `elements_per_kernel`
/// elements each. The final task takes everything from its offset to
/// `total_elements`, so the windows always cover the whole buffer.
///
/// `index` must be below `n_tasks`.
pub fn chunk(
    index: usize,
    n_tasks: usize,
    elements_per_kernel: usize,
    total_elements: usize,
) -> Chunk {
    debug_assert!(index < n_tasks, "task {index} out of {n_tasks}");
    let offset = index * elements_per_kernel;
    let width = if index + 1 == n_tasks {
        total_elements - offset
    } else {
        elements_per_kernel
    };
    Chunk { offset, width }
}

/// All chunks of a task space, in index order.
pub fn chunks(
    n_tasks: usize,
    elements_per_kernel: usize,
    total_elements: usize,
) -> impl Iterator<Item = Chunk> {
    (0..n_tasks).map(move |i| chunk(i, n_tasks, elements_per_kernel, total_elements))
}
