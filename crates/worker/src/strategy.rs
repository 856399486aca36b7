//! 执行策略
//!
//! `InProcess` 在调用方运行时上派生任务；`WorkerPool` 把执行交给独立线程，
//! 每个工作项在线程内新建单线程运行时，结束后运行时随之销毁。

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use scheduler_core::{DispatchConfig, DispatchStrategyKind};
use scheduler_domain::entities::JobExecution;
use scheduler_errors::{SchedulerError, SchedulerResult};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::retrying_dispatcher::{DispatchJob, RetryingDispatcher};

struct WorkItem {
    dispatcher: Arc<RetryingDispatcher>,
    job: DispatchJob,
    reply: oneshot::Sender<SchedulerResult<JobExecution>>,
}

pub enum ExecutionStrategy {
    InProcess,
    WorkerPool(WorkerPool),
}

impl ExecutionStrategy {
    pub fn from_config(config: &DispatchConfig) -> SchedulerResult<Self> {
        match config.strategy {
            DispatchStrategyKind::InProcess => Ok(Self::InProcess),
            DispatchStrategyKind::WorkerPool => {
                Ok(Self::WorkerPool(WorkerPool::new(config.worker_threads)?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::WorkerPool(_) => "worker_pool",
        }
    }

    /// 提交执行并等待终态
    pub async fn execute(
        &self,
        dispatcher: Arc<RetryingDispatcher>,
        job: DispatchJob,
    ) -> SchedulerResult<JobExecution> {
        match self {
            Self::InProcess => tokio::spawn(async move { dispatcher.dispatch(job).await })
                .await
                .map_err(|e| SchedulerError::Internal(format!("执行任务异常退出: {e}")))?,
            Self::WorkerPool(pool) => pool.execute(dispatcher, job).await,
        }
    }

    pub fn shutdown(&self) {
        if let Self::WorkerPool(pool) = self {
            pool.shutdown();
        }
    }
}

/// 固定大小的执行线程池
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> SchedulerResult<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::channel::<WorkItem>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-worker-{index}"))
                .spawn(move || worker_loop(index, receiver))
                .map_err(|e| SchedulerError::Internal(format!("无法启动执行线程: {e}")))?;
            workers.push(handle);
        }
        info!(threads, "执行线程池已启动");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    pub async fn execute(
        &self,
        dispatcher: Arc<RetryingDispatcher>,
        job: DispatchJob,
    ) -> SchedulerResult<JobExecution> {
        let (reply, response) = oneshot::channel();
        {
            let guard = self
                .sender
                .lock()
                .map_err(|_| SchedulerError::Internal("执行线程池状态损坏".to_string()))?;
            let sender = guard
                .as_ref()
                .ok_or_else(|| SchedulerError::Internal("执行线程池已关闭".to_string()))?;
            sender
                .send(WorkItem {
                    dispatcher,
                    job,
                    reply,
                })
                .map_err(|_| SchedulerError::Internal("执行线程池已关闭".to_string()))?;
        }

        response
            .await
            .map_err(|_| SchedulerError::Internal("执行线程未返回结果".to_string()))?
    }

    /// 停止接收新任务，等待已提交的任务完成
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for worker in workers {
            if worker.join().is_err() {
                error!("执行线程异常退出");
            }
        }
        info!("执行线程池已关闭");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

fn worker_loop(index: usize, receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>) {
    loop {
        let item = {
            let Ok(guard) = receiver.lock() else {
                return;
            };
            match guard.recv() {
                Ok(item) => item,
                Err(_) => return,
            }
        };

        let WorkItem {
            dispatcher,
            job,
            reply,
        } = item;

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = reply.send(Err(SchedulerError::Internal(format!(
                    "无法创建执行运行时: {e}"
                ))));
                continue;
            }
        };

        debug!(worker = index, execution_id = %job.execution_id, "执行线程接收任务");
        let result = runtime.block_on(dispatcher.dispatch(job));
        let _ = reply.send(result);
    }
}
