#![doc = include_str!("../README.md")]
use thiserror::Error;

mod aggregate;
mod classify;
mod grid;
mod pool;
mod raster;
mod sequential;
mod stats;
mod task;

pub use aggregate::{combine, combine_all};
pub use classify::{CellClassifier, CellSample, COVERAGE_THRESHOLD};
pub use grid::{buffer_rect, AlignedBlock, RasterGridSpec, Transform};
pub use pool::{
    AggregationFn, CancellationToken, JobError, JobResult, PoolBuilder, ProgressFn, WorkerPool,
    WorkerResult, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_CAPACITY,
};
pub use raster::{MemoryRaster, RasterBlock, RasterSource};
pub use sequential::pixelize_sequential;
pub use stats::{Stats, StatsAccumulator};
pub use task::{PixelizeTask, Pixelized, ProgressObserver, RunResult, TaskHandle, TaskState};

#[cfg(test)]
mod proptests;

/// 本库的错误类型
/// 包含对齐、读取栅格以及并行执行过程中可能遇到的各种错误
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum PixelizeError {
    /// 提供的几何图形中至少有一个坐标是NaN或无限的
    #[error("提供的几何图形中至少有一个坐标是NaN或无限的")]
    NonFiniteCoordinate,

    /// 栅格网格参数无效，例如像素大小不是正的有限值
    #[error("无效的栅格网格: {0}")]
    InvalidGrid(String),

    /// 无法从栅格源读取所需的数据，例如波段不存在
    #[error("无法读取栅格数据: {0}")]
    DataUnavailable(String),

    /// 某个工作单元失败或发生panic
    #[error(transparent)]
    Job(#[from] JobError),

    /// 无法启动工作线程
    #[error("无法启动工作线程: {0}")]
    WorkerSpawn(String),

    /// 工作池已经关闭，不再接受新的工作单元
    #[error("工作池已关闭")]
    PoolClosed,

    /// 任务在完成之前被取消
    #[error("任务已取消")]
    Cancelled,
}

/// 本库使用的结果类型，使用[PixelizeError]作为错误类型。
pub type Result<T> = std::result::Result<T, PixelizeError>;

#[cfg(test)]
mod tests;
