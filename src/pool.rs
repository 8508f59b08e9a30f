use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender,
};
use thiserror::Error;

use crate::{PixelizeError, Result};

/// 输入队列的默认容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// 空闲工作线程检查取消标志的默认间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 单个任务的错误
///
/// 任务失败不会让整个线程池失败，错误被记录在该任务的[WorkerResult]中，
/// 由调用方决定是否中止。
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum JobError {
    /// 任务函数返回了错误
    #[error("任务执行失败: {0}")]
    Failed(String),

    /// 任务函数或聚合函数发生了panic
    #[error("任务发生panic: {0}")]
    Panicked(String),
}

/// 任务函数的返回类型
pub type JobResult<T> = std::result::Result<T, JobError>;

/// 聚合函数：把一个任务结果折叠进工作线程的本地累加值
pub type AggregationFn<T> = Arc<dyn Fn(Option<T>, T) -> T + Send + Sync>;

/// 进度回调：每完成一个任务调用一次，可能在任意工作线程中调用
pub type ProgressFn = Arc<dyn Fn() + Send + Sync>;

type Job<T> = Box<dyn FnOnce(&CancellationToken) -> JobResult<T> + Send>;

/// 协作式取消标志
///
/// 克隆出的所有副本共享同一个标志。取消只会在检查点被观察到，
/// 不会打断正在执行的任务。
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// 请求取消
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 一个任务（或一个工作线程的本地聚合值）的结果
///
/// 由执行任务的工作线程写入一次，再由排空结果的调用方读取一次。
#[derive(Debug)]
pub struct WorkerResult<T> {
    value: Option<T>,
    error: Option<JobError>,
}

impl<T> WorkerResult<T> {
    fn from_job(outcome: JobResult<T>) -> Self {
        match outcome {
            Ok(value) => WorkerResult {
                value: Some(value),
                error: None,
            },
            Err(error) => WorkerResult {
                value: None,
                error: Some(error),
            },
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// 有错误时返回错误，否则返回（可能为空的）结果值
    pub fn into_result(self) -> JobResult<Option<T>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.value),
        }
    }
}

/// 工作线程池构建器，用于构造[WorkerPool]实例。
///
/// # 示例
///
/// ```rust
/// # fn main() -> geo_pixelize::Result<()> {
/// use std::sync::Arc;
/// use geo_pixelize::PoolBuilder;
///
/// let pool = PoolBuilder::new()
///     .workers(4)
///     .aggregation(Arc::new(|sum: Option<u64>, item: u64| sum.unwrap_or(0) + item))
///     .build()?;
/// for i in 1..=100u64 {
///     pool.submit(move |_| Ok(i))?;
/// }
/// let total: u64 = pool.drain().filter_map(|r| r.into_result().ok().flatten()).sum();
/// assert_eq!(total, 5050);
/// # Ok(())}
/// ```
pub struct PoolBuilder<T> {
    workers: Option<usize>,
    queue_capacity: usize,
    poll_interval: Duration,
    progress: Option<ProgressFn>,
    cancel: Option<CancellationToken>,
    aggregation: Option<AggregationFn<T>>,
}

impl<T> Default for PoolBuilder<T> {
    fn default() -> Self {
        PoolBuilder {
            workers: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            progress: None,
            cancel: None,
            aggregation: None,
        }
    }
}

impl<T> PoolBuilder<T>
where
    T: Send + 'static,
{
    pub fn new() -> Self {
        PoolBuilder::default()
    }

    /// 设置工作线程数量，默认为CPU核数
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// 设置有界输入队列的容量
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// 设置空闲工作线程检查取消标志的间隔
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// 设置聚合函数
    ///
    /// 设置后，工作线程不再逐个发送任务结果，而是把自己完成的所有结果
    /// 折叠成一个本地累加值，并在停止时只发送这一个结果。
    pub fn aggregation(mut self, aggregation: AggregationFn<T>) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// 启动所有工作线程
    ///
    /// # 错误
    /// 操作系统无法创建线程时返回[PixelizeError::WorkerSpawn]
    pub fn build(self) -> Result<WorkerPool<T>> {
        let worker_count = self.workers.unwrap_or_else(num_cpus::get).max(1);
        let (job_sender, job_receiver) = bounded::<Job<T>>(self.queue_capacity.max(1));
        let (result_sender, result_receiver) = unbounded();
        let cancel = self.cancel.unwrap_or_default();

        let mut pool = WorkerPool {
            jobs: Some(job_sender),
            results: result_receiver,
            workers: Vec::with_capacity(worker_count),
            cancel: cancel.clone(),
            poll_interval: self.poll_interval,
        };

        for index in 0..worker_count {
            let worker = Worker {
                jobs: job_receiver.clone(),
                results: result_sender.clone(),
                cancel: cancel.clone(),
                progress: self.progress.clone(),
                aggregation: self.aggregation.clone(),
                poll_interval: self.poll_interval,
            };
            let handle = std::thread::Builder::new()
                .name(format!("pixelize-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| PixelizeError::WorkerSpawn(e.to_string()))?;
            pool.workers.push(handle);
        }

        Ok(pool)
    }
}

/// 通用的并行任务执行器
///
/// 任务经过有界输入队列分发给固定数量的工作线程；提交在队列满时阻塞，
/// 因此生产者再快内存也有上限。结果在[WorkerPool::drain]中统一取出，
/// 各工作线程之间的结果顺序不保证与提交顺序一致。
pub struct WorkerPool<T> {
    jobs: Option<Sender<Job<T>>>,
    results: Receiver<WorkerResult<T>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl<T> WorkerPool<T>
where
    T: Send + 'static,
{
    /// 使用默认配置和指定数量的工作线程创建线程池
    pub fn new(workers: usize) -> Result<Self> {
        PoolBuilder::new().workers(workers).build()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 提交一个任务
    ///
    /// 输入队列已满时阻塞，直到有空位或者观察到取消请求。
    ///
    /// # 错误
    /// 已请求取消时返回[PixelizeError::Cancelled]；
    /// 所有工作线程都已退出时返回[PixelizeError::PoolClosed]
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&CancellationToken) -> JobResult<T> + Send + 'static,
    {
        let sender = self.jobs.as_ref().ok_or(PixelizeError::PoolClosed)?;
        let mut job: Job<T> = Box::new(job);
        loop {
            if self.cancel.is_cancelled() {
                return Err(PixelizeError::Cancelled);
            }
            match sender.send_timeout(job, self.poll_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => job = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Err(PixelizeError::PoolClosed),
            }
        }
    }

    /// 声明不再提交任务，等待输入队列清空、所有工作线程停止，然后返回全部结果
    ///
    /// 没有聚合函数时每个任务对应一个结果；有聚合函数时每个工作线程对应一个结果。
    /// 已请求取消时，队列中尚未开始的任务会被丢弃。
    pub fn drain(mut self) -> impl Iterator<Item = WorkerResult<T>> {
        self.shutdown();
        self.results.try_iter().collect::<Vec<_>>().into_iter()
    }
}

impl<T> WorkerPool<T> {
    fn shutdown(&mut self) {
        // 关闭发送端后，工作线程取完剩余任务就会退出
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if let Err(payload) = handle.join() {
                log::warn!("工作线程异常退出: {}", panic_message(payload.as_ref()));
            }
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 单个工作线程的状态，线程启动时移入线程内部
struct Worker<T> {
    jobs: Receiver<Job<T>>,
    results: Sender<WorkerResult<T>>,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
    aggregation: Option<AggregationFn<T>>,
    poll_interval: Duration,
}

impl<T> Worker<T> {
    fn run(self) {
        let mut local: Option<T> = None;
        let mut local_error: Option<JobError> = None;

        while !self.cancel.is_cancelled() {
            let job = match self.jobs.recv_timeout(self.poll_interval) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let outcome = guarded(|| job(&self.cancel));

            match &self.aggregation {
                None => {
                    let _ = self.results.send(WorkerResult::from_job(outcome));
                }
                Some(aggregation) => match outcome {
                    Ok(item) => {
                        let previous = local.take();
                        match guarded(|| Ok(aggregation(previous, item))) {
                            Ok(folded) => local = Some(folded),
                            Err(error) => {
                                local_error.get_or_insert(error);
                            }
                        }
                    }
                    Err(error) => {
                        local_error.get_or_insert(error);
                    }
                },
            }

            if let Some(progress) = &self.progress {
                let _ = guarded(|| {
                    progress();
                    Ok(())
                });
            }
        }

        if self.aggregation.is_some() {
            let _ = self.results.send(WorkerResult {
                value: local,
                error: local_error,
            });
        }
    }
}

/// 执行函数并把panic转换为[JobError::Panicked]
fn guarded<T, F>(f: F) -> JobResult<T>
where
    F: FnOnce() -> JobResult<T>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        log::warn!("任务发生panic: {message}");
        Err(JobError::Panicked(message))
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知的panic".to_string()
    }
}
