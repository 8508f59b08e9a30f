use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crossbeam::atomic::AtomicCell;
use geo::MultiPolygon;

use crate::aggregate::{combine, combine_all};
use crate::classify::{CellClassifier, CellSample};
use crate::pool::{
    panic_message, CancellationToken, JobError, PoolBuilder, DEFAULT_QUEUE_CAPACITY,
};
use crate::raster::RasterSource;
use crate::stats::{Stats, StatsAccumulator};
use crate::{PixelizeError, Result};

/// 进度观察者，参数是 `[0, 100]` 之间的百分比，调用序列单调不减
pub type ProgressObserver = Arc<dyn Fn(f64) + Send + Sync>;

type CompletionFn = Box<dyn FnOnce(&RunResult) + Send>;

/// 任务状态：`Pending → Running → {Completed, Cancelled, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// 像素化的结果：沿像素边界的新几何与被覆盖像素的统计
///
/// 没有任何像素匹配时两者都为`None`，这不是错误。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pixelized {
    pub geometry: Option<MultiPolygon<f64>>,
    pub stats: Option<Stats>,
}

/// 一次运行的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Completed(Pixelized),
    Cancelled,
    Failed(PixelizeError),
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunResult::Completed(_))
    }

    /// 取出完成时的结果，取消或失败时返回`None`
    pub fn completed(self) -> Option<Pixelized> {
        match self {
            RunResult::Completed(pixelized) => Some(pixelized),
            _ => None,
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            RunResult::Completed(_) => TaskState::Completed,
            RunResult::Cancelled => TaskState::Cancelled,
            RunResult::Failed(_) => TaskState::Failed,
        }
    }
}

impl From<Result<Pixelized>> for RunResult {
    fn from(result: Result<Pixelized>) -> Self {
        match result {
            Ok(pixelized) => RunResult::Completed(pixelized),
            Err(PixelizeError::Cancelled) => RunResult::Cancelled,
            Err(error) => RunResult::Failed(error),
        }
    }
}

/// 两个阶段共享的进度计数
struct Progress {
    done: AtomicUsize,
    total: usize,
    observer: Option<ProgressObserver>,
    last_reported: Mutex<f64>,
}

impl Progress {
    fn new(total: usize, observer: Option<ProgressObserver>) -> Self {
        Progress {
            done: AtomicUsize::new(0),
            total,
            observer,
            last_reported: Mutex::new(0.),
        }
    }

    fn tick(&self) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.report(done);
    }

    fn finish(&self) {
        self.report(self.total);
    }

    fn report(&self, done: usize) {
        let observer = match &self.observer {
            Some(observer) => observer,
            None => return,
        };
        let percent = if self.total == 0 {
            100.
        } else {
            done.min(self.total) as f64 / self.total as f64 * 100.
        };
        // 串行化上报，观察者看到的百分比不会倒退
        let mut last = self
            .last_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if percent > *last {
            *last = percent;
            observer(percent);
        }
    }
}

/// 将一个几何对齐到栅格网格并计算被覆盖像素统计的任务
///
/// 运行分两个阶段：先在线程池中并行分类所有像素，
/// 再把匹配像素的矩形交给带聚合函数的第二个线程池，每个工作线程只合并自己处理过的矩形，
/// 最后把各线程的局部结果合并成一个几何。
///
/// # 示例
///
/// ```rust
/// # fn main() -> geo_pixelize::Result<()> {
/// use std::sync::Arc;
/// use geo::polygon;
/// use ndarray::Array2;
/// use geo_pixelize::{MemoryRaster, PixelizeTask};
///
/// let raster = Arc::new(MemoryRaster::new(0., 0., 1., 1., vec![Array2::from_elem((10, 10), 2.5f32)])?);
/// let field = polygon![(x: 1., y: 1.), (x: 4., y: 1.), (x: 4., y: 3.), (x: 1., y: 3.)];
///
/// let result = PixelizeTask::new(raster, 1, field).workers(2).run();
/// let pixelized = result.completed().unwrap();
/// let stats = pixelized.stats.unwrap();
/// assert_eq!(stats.count, 6);
/// assert_eq!(stats.to_string(), "2.50");
/// # Ok(())}
/// ```
pub struct PixelizeTask<R: ?Sized> {
    raster: Arc<R>,
    band: usize,
    geometry: MultiPolygon<f64>,
    workers: Option<usize>,
    queue_capacity: usize,
    cancel: CancellationToken,
    state: Arc<AtomicCell<TaskState>>,
    on_progress: Option<ProgressObserver>,
    on_completed: Option<CompletionFn>,
}

impl<R> PixelizeTask<R>
where
    R: RasterSource + ?Sized,
{
    /// 创建任务
    ///
    /// # 参数
    /// * `raster` - 提供网格与采样值的栅格
    /// * `band` - 用于统计的波段（从1开始）
    /// * `geometry` - 要对齐到栅格网格的几何
    pub fn new(raster: Arc<R>, band: usize, geometry: impl Into<MultiPolygon<f64>>) -> Self {
        PixelizeTask {
            raster,
            band,
            geometry: geometry.into(),
            workers: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cancel: CancellationToken::new(),
            state: Arc::new(AtomicCell::new(TaskState::Pending)),
            on_progress: None,
            on_completed: None,
        }
    }

    /// 设置每个线程池的工作线程数量，默认为CPU核数
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// 设置进度观察者，可能在任意工作线程中被调用
    pub fn on_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(observer));
        self
    }

    /// 设置完成回调，运行结束时以最终结果调用一次
    pub fn on_completed<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&RunResult) + Send + 'static,
    {
        self.on_completed = Some(Box::new(callback));
        self
    }

    /// 与任务共享的取消标志
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 请求取消；已经在执行的任务会跑完，但结果会被丢弃
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// 在当前线程中执行任务，阻塞直到结束
    pub fn run(mut self) -> RunResult {
        self.state.store(TaskState::Running);
        log::info!(
            "开始像素化: 波段{}，{}个多边形",
            self.band,
            self.geometry.0.len()
        );

        let result = RunResult::from(self.execute());
        self.state.store(result.state());
        match &result {
            RunResult::Completed(pixelized) => log::info!(
                "像素化完成: {}个像素匹配",
                pixelized.stats.map_or(0, |stats| stats.count)
            ),
            RunResult::Cancelled => log::info!("像素化已取消"),
            RunResult::Failed(error) => log::warn!("像素化失败: {error}"),
        }

        if let Some(on_completed) = self.on_completed.take() {
            on_completed(&result);
        }
        result
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            log::debug!("观察到取消请求");
            return Err(PixelizeError::Cancelled);
        }
        Ok(())
    }

    fn pool_builder<T>(&self, progress: &Arc<Progress>) -> PoolBuilder<T>
    where
        T: Send + 'static,
    {
        let progress = Arc::clone(progress);
        let builder = PoolBuilder::new()
            .queue_capacity(self.queue_capacity)
            .cancel_token(self.cancel.clone())
            .progress(Arc::new(move || progress.tick()));
        match self.workers {
            Some(workers) => builder.workers(workers),
            None => builder,
        }
    }

    fn execute(&self) -> Result<Pixelized> {
        self.checkpoint()?;
        let classifier =
            match CellClassifier::prepare(self.raster.as_ref(), self.band, &self.geometry)? {
                Some(classifier) => Arc::new(classifier),
                None => return Ok(Pixelized::default()),
            };
        let block = *classifier.block();
        log::debug!(
            "对齐块 {}x{} 像素，范围 {:?}",
            block.width,
            block.height,
            block.rect
        );

        // 每个像素分类算一个单位，每个匹配像素的合并（或未匹配像素的跳过）再算一个单位
        let progress = Arc::new(Progress::new(
            block.cell_count() * 2,
            self.on_progress.clone(),
        ));
        let classify_pool = self.pool_builder::<CellSample>(&progress).build()?;
        let union_pool = self
            .pool_builder::<MultiPolygon<f64>>(&progress)
            .aggregation(Arc::new(combine))
            .build()?;
        log::debug!("每个阶段使用{}个工作线程", classify_pool.worker_count());

        for row in 0..block.height {
            self.checkpoint()?;
            for col in 0..block.width {
                let classifier = Arc::clone(&classifier);
                classify_pool.submit(move |_| classifier.classify(row, col))?;
            }
        }
        self.checkpoint()?;

        // 统计只在当前线程中累加，不需要加锁
        let mut stats = StatsAccumulator::new(block.cell_count());
        for result in classify_pool.drain() {
            self.checkpoint()?;
            let sample = match result.into_result()? {
                Some(sample) => sample,
                None => continue,
            };
            match sample.value {
                Some(value) => {
                    stats.add(block.cell_index(sample.row, sample.col), value);
                    let rect = sample.rect;
                    union_pool.submit(move |_| Ok(MultiPolygon::from(rect.to_polygon())))?;
                }
                None => progress.tick(),
            }
        }
        log::debug!("分类完成: {}个像素匹配", stats.count());

        let mut parts = Vec::with_capacity(union_pool.worker_count());
        for result in union_pool.drain() {
            self.checkpoint()?;
            if let Some(part) = result.into_result()? {
                parts.push(part);
            }
        }
        log::debug!("合并完成: {}个局部结果", parts.len());
        let geometry = combine_all(parts);
        self.checkpoint()?;

        progress.finish();
        Ok(Pixelized {
            geometry,
            stats: stats.finish(),
        })
    }
}

impl<R> PixelizeTask<R>
where
    R: RasterSource + ?Sized + 'static,
{
    /// 在后台线程中启动任务
    ///
    /// # 错误
    /// 无法创建线程时返回[PixelizeError::WorkerSpawn]
    pub fn start(self) -> Result<TaskHandle> {
        let cancel = self.cancel.clone();
        let state = Arc::clone(&self.state);
        let thread = std::thread::Builder::new()
            .name("pixelize-task".to_string())
            .spawn(move || self.run())
            .map_err(|e| PixelizeError::WorkerSpawn(e.to_string()))?;
        Ok(TaskHandle {
            cancel,
            state,
            thread,
        })
    }
}

/// 后台运行中的任务句柄
#[derive(Debug)]
pub struct TaskHandle {
    cancel: CancellationToken,
    state: Arc<AtomicCell<TaskState>>,
    thread: JoinHandle<RunResult>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// 等待任务结束并取回结果
    pub fn join(self) -> RunResult {
        self.thread.join().unwrap_or_else(|payload| {
            let error = JobError::Panicked(panic_message(payload.as_ref()));
            self.state.store(TaskState::Failed);
            RunResult::Failed(error.into())
        })
    }
}
