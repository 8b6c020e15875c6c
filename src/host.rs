// 该文件是 Piliang （批量推理） 项目的一部分。
// src/host.rs - 本地批量作业主机
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::{
  config::{ConfigError, DeploymentConfig, OutputAction},
  output::{OutputError, OutputWrapper, Render, write_job_summary},
  record::{BatchOutput, MiniBatch, RecordSchema, SkippedItem, common_root, partition},
  scorer::{OutputMode, ScoringCallback, WorkerEnv},
  worker::{Worker, WorkerError},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum HostError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("无法启动工作线程: {0}")]
  Spawn(std::io::Error),
  #[error("主机状态锁已失效")]
  Poisoned,
  #[error("调度线程异常退出")]
  SlotPanicked,
}

/// 主机侧的作业参数
#[derive(Debug, Clone)]
pub struct HostConfig {
  pub mini_batch_size: usize,
  pub workers: usize,
  pub max_retries: u32,
  /// 单个小批次一次尝试的时限
  pub timeout: Duration,
  /// 工作进程初始化的时限，`None` 表示一直等待
  pub init_timeout: Option<Duration>,
  pub error_threshold: i64,
  pub output_action: OutputAction,
  pub output_file_name: String,
  pub output_dir: PathBuf,
  pub schema: Option<RecordSchema>,
  pub env: WorkerEnv,
}

impl HostConfig {
  pub fn new(env: WorkerEnv, output_dir: impl Into<PathBuf>) -> Self {
    let deployment = DeploymentConfig::default();
    Self {
      mini_batch_size: deployment.mini_batch_size,
      workers: deployment.workers(),
      max_retries: deployment.retry_settings.max_retries,
      timeout: deployment.timeout(),
      init_timeout: deployment.init_timeout(),
      error_threshold: deployment.error_threshold,
      output_action: deployment.output_action,
      output_file_name: deployment.output_file_name,
      output_dir: output_dir.into(),
      schema: None,
      env,
    }
  }

  pub fn from_deployment(
    deployment: &DeploymentConfig,
    env: WorkerEnv,
    output_dir: impl Into<PathBuf>,
  ) -> Result<Self, ConfigError> {
    deployment.validate()?;
    Ok(Self {
      mini_batch_size: deployment.mini_batch_size,
      workers: deployment.workers(),
      max_retries: deployment.retry_settings.max_retries,
      timeout: deployment.timeout(),
      init_timeout: deployment.init_timeout(),
      error_threshold: deployment.error_threshold,
      output_action: deployment.output_action,
      output_file_name: deployment.output_file_name.clone(),
      output_dir: output_dir.into(),
      schema: deployment.schema.clone(),
      env,
    })
  }
}

/// 停止继续派发小批次
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_canceled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Completed,
  Failed,
  Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBatch {
  pub batch: usize,
  pub items: Vec<PathBuf>,
  pub attempts: u32,
  pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
  pub status: JobStatus,
  pub reason: Option<String>,
  pub total_items: usize,
  pub total_batches: usize,
  pub succeeded_batches: usize,
  pub failed_batches: Vec<FailedBatch>,
  pub unprocessed_batches: usize,
  pub scored_items: usize,
  pub failed_items: usize,
  pub skipped_items: Vec<SkippedItem>,
  pub retries: usize,
  pub worker_starts: usize,
  pub worker_init_failures: usize,
  pub schema: Option<RecordSchema>,
  pub output_file: Option<PathBuf>,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  pub elapsed_secs: f64,
}

enum StopReason {
  ThresholdExceeded(usize),
  AllWorkersFailed(String),
  Output(String),
}

impl StopReason {
  fn describe(&self) -> String {
    match self {
      StopReason::ThresholdExceeded(n) => format!("失败条目数 {} 超过阈值", n),
      StopReason::AllWorkersFailed(e) => format!("所有工作进程初始化失败: {}", e),
      StopReason::Output(e) => format!("写入结果失败: {}", e),
    }
  }
}

struct Pending {
  batch: Arc<MiniBatch>,
  /// 已经失败的尝试次数
  attempt: u32,
}

struct JobState {
  queue: VecDeque<Pending>,
  in_flight: usize,
  live_slots: usize,
  succeeded: usize,
  failed: Vec<FailedBatch>,
  failed_items: usize,
  scored_items: usize,
  skipped: Vec<SkippedItem>,
  retries: usize,
  worker_starts: usize,
  init_failures: usize,
  schema: Option<RecordSchema>,
  stop: Option<StopReason>,
}

impl JobState {
  fn new(batches: Vec<MiniBatch>, slots: usize) -> Self {
    Self {
      queue: batches
        .into_iter()
        .map(|batch| Pending {
          batch: Arc::new(batch),
          attempt: 0,
        })
        .collect(),
      in_flight: 0,
      live_slots: slots,
      succeeded: 0,
      failed: Vec::new(),
      failed_items: 0,
      scored_items: 0,
      skipped: Vec::new(),
      retries: 0,
      worker_starts: 0,
      init_failures: 0,
      schema: None,
      stop: None,
    }
  }

  fn fail_batch(&mut self, pending: Pending, error: String) {
    self.failed_items += pending.batch.len();
    self.failed.push(FailedBatch {
      batch: pending.batch.id(),
      items: pending.batch.items().to_vec(),
      attempts: pending.attempt,
      error,
    });
  }
}

enum WorkerEvent {
  Ready(RecordSchema),
  InitFailed(WorkerError),
  Scored(Result<BatchOutput, WorkerError>),
}

enum Attempt {
  Done(BatchOutput),
  /// 工作进程仍可用
  Failed(String),
  /// 工作进程超时或退出，需要重新启动
  Lost(String),
}

/// 在独立线程上运行的工作进程
struct WorkerHandle {
  id: usize,
  jobs: mpsc::Sender<Arc<MiniBatch>>,
  events: mpsc::Receiver<WorkerEvent>,
}

impl WorkerHandle {
  fn spawn<C: ScoringCallback>(
    id: usize,
    callback: Arc<C>,
    env: WorkerEnv,
    expected: Option<RecordSchema>,
  ) -> Result<Self, HostError> {
    let (job_tx, job_rx) = mpsc::channel::<Arc<MiniBatch>>();
    let (event_tx, event_rx) = mpsc::channel();

    thread::Builder::new()
      .name(format!("piliang-worker-{}", id))
      .spawn(move || {
        let span = info_span!("worker", id);
        let _enter = span.enter();

        let mut worker = Worker::new(id, callback);
        match worker.init(&env, expected.as_ref()) {
          Ok(schema) => {
            if event_tx.send(WorkerEvent::Ready(schema)).is_err() {
              return;
            }
          }
          Err(e) => {
            let _ = event_tx.send(WorkerEvent::InitFailed(e));
            return;
          }
        }

        for batch in job_rx {
          let result = worker.score(&batch);
          if event_tx.send(WorkerEvent::Scored(result)).is_err() {
            break;
          }
        }
        debug!("工作进程 {} 退出", id);
      })
      .map_err(HostError::Spawn)?;

    Ok(Self {
      id,
      jobs: job_tx,
      events: event_rx,
    })
  }

  fn score(&self, batch: &Arc<MiniBatch>, timeout: Duration) -> Attempt {
    if self.jobs.send(batch.clone()).is_err() {
      return Attempt::Lost(format!("工作进程 {} 已退出", self.id));
    }
    match self.events.recv_timeout(timeout) {
      Ok(WorkerEvent::Scored(Ok(output))) => Attempt::Done(output),
      Ok(WorkerEvent::Scored(Err(e))) => Attempt::Failed(e.to_string()),
      Ok(_) => Attempt::Lost(format!("工作进程 {} 返回了意外事件", self.id)),
      Err(RecvTimeoutError::Timeout) => {
        Attempt::Lost(format!("小批次 {} 超过 {:?} 未完成", batch.id(), timeout))
      }
      Err(RecvTimeoutError::Disconnected) => {
        Attempt::Lost(format!("工作进程 {} 异常退出", self.id))
      }
    }
  }
}

struct Shared<'a> {
  state: Mutex<JobState>,
  wake: Condvar,
  output: OutputWrapper,
  config: &'a HostConfig,
  env: WorkerEnv,
  cancel: &'a CancelToken,
  next_worker_id: AtomicUsize,
}

impl Shared<'_> {
  fn lock(&self) -> Result<MutexGuard<'_, JobState>, HostError> {
    self.state.lock().map_err(|_| HostError::Poisoned)
  }

  fn next_batch(&self) -> Result<Option<Pending>, HostError> {
    let mut state = self.lock()?;
    loop {
      if state.stop.is_some() || self.cancel.is_canceled() {
        return Ok(None);
      }
      if let Some(pending) = state.queue.pop_front() {
        state.in_flight += 1;
        return Ok(Some(pending));
      }
      // 队列为空但仍有小批次在处理，它们可能失败后重新排队
      if state.in_flight == 0 {
        return Ok(None);
      }
      let (guard, _) = self
        .wake
        .wait_timeout(state, POLL_INTERVAL)
        .map_err(|_| HostError::Poisoned)?;
      state = guard;
    }
  }

  fn check_threshold(&self, state: &mut JobState) {
    let threshold = self.config.error_threshold;
    if threshold >= 0 && state.failed_items > threshold as usize && state.stop.is_none() {
      error!(
        "失败条目数 {} 超过阈值 {}, 停止派发",
        state.failed_items, threshold
      );
      state.stop = Some(StopReason::ThresholdExceeded(state.failed_items));
    }
  }

  fn start_worker<C: ScoringCallback>(
    &self,
    slot: usize,
    callback: &Arc<C>,
  ) -> Result<Result<WorkerHandle, String>, HostError> {
    let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
    debug!("调度槽 {} 启动工作进程 {}", slot, id);
    let handle = WorkerHandle::spawn(
      id,
      callback.clone(),
      self.env.clone(),
      self.config.schema.clone(),
    )?;
    let event = match self.config.init_timeout {
      Some(limit) => handle.events.recv_timeout(limit),
      None => handle
        .events
        .recv()
        .map_err(|_| RecvTimeoutError::Disconnected),
    };

    let mut state = self.lock()?;
    state.worker_starts += 1;
    let failure = match event {
      Ok(WorkerEvent::Ready(schema)) => {
        // 第一个就绪的工作进程确定本作业的输出列
        let expected = state.schema.get_or_insert_with(|| schema.clone());
        if *expected != schema {
          Some(format!(
            "工作进程 {} 输出列 {} 与 {} 不一致",
            id, schema, expected
          ))
        } else {
          None
        }
      }
      Ok(WorkerEvent::InitFailed(e)) => Some(e.to_string()),
      Ok(WorkerEvent::Scored(_)) => Some(format!("工作进程 {} 返回了意外事件", id)),
      Err(RecvTimeoutError::Timeout) => Some(format!(
        "工作进程 {} 初始化超过 {:?}",
        id,
        self.config.init_timeout.unwrap_or_default()
      )),
      Err(RecvTimeoutError::Disconnected) => Some(format!("工作进程 {} 初始化时异常退出", id)),
    };

    match failure {
      None => Ok(Ok(handle)),
      Some(reason) => {
        state.init_failures += 1;
        error!("调度槽 {} 的工作进程不可用: {}", slot, reason);
        Ok(Err(reason))
      }
    }
  }

  fn complete(&self, pending: Pending, output: BatchOutput) -> Result<(), HostError> {
    let rendered = self.output.render_result(&pending.batch, &output);

    let mut state = self.lock()?;
    state.in_flight -= 1;
    match rendered {
      Ok(()) => {
        state.succeeded += 1;
        state.scored_items += output.results.len();
        state.failed_items += output.skipped.len();
        state.skipped.extend(output.skipped);
        self.check_threshold(&mut state);
      }
      Err(e) => {
        error!("小批次 {} 结果写入失败: {}", pending.batch.id(), e);
        if state.stop.is_none() {
          state.stop = Some(StopReason::Output(e.to_string()));
        }
        state.fail_batch(pending, e.to_string());
      }
    }
    drop(state);
    self.wake.notify_all();
    Ok(())
  }

  fn attempt_failed(&self, mut pending: Pending, reason: String) -> Result<(), HostError> {
    let mut state = self.lock()?;
    state.in_flight -= 1;
    pending.attempt += 1;

    if pending.attempt <= self.config.max_retries && state.stop.is_none() {
      warn!(
        "小批次 {} 第 {} 次尝试失败: {}, 重新排队",
        pending.batch.id(),
        pending.attempt,
        reason
      );
      state.retries += 1;
      state.queue.push_back(pending);
    } else {
      error!(
        "小批次 {} 在 {} 次尝试后失败: {}",
        pending.batch.id(),
        pending.attempt,
        reason
      );
      state.fail_batch(pending, reason);
      self.check_threshold(&mut state);
    }
    drop(state);
    self.wake.notify_all();
    Ok(())
  }

  /// 调度槽的工作进程初始化失败，小批次交还给其他调度槽
  fn slot_lost(&self, pending: Pending, reason: String) -> Result<(), HostError> {
    let mut state = self.lock()?;
    state.in_flight -= 1;
    state.live_slots -= 1;
    state.queue.push_front(pending);

    if state.live_slots == 0 {
      error!("没有可用的工作进程, 剩余小批次全部失败");
      while let Some(pending) = state.queue.pop_front() {
        state.fail_batch(pending, reason.clone());
      }
      if state.stop.is_none() {
        state.stop = Some(StopReason::AllWorkersFailed(reason));
      }
    }
    drop(state);
    self.wake.notify_all();
    Ok(())
  }

  fn run_slot<C: ScoringCallback>(&self, slot: usize, callback: &Arc<C>) -> Result<(), HostError> {
    let span = info_span!("slot", slot);
    let _enter = span.enter();

    let mut worker: Option<WorkerHandle> = None;
    while let Some(pending) = self.next_batch()? {
      let handle = match worker.take() {
        Some(handle) => handle,
        None => match self.start_worker(slot, callback)? {
          Ok(handle) => handle,
          Err(reason) => {
            self.slot_lost(pending, reason)?;
            return Ok(());
          }
        },
      };

      let now = Instant::now();
      match handle.score(&pending.batch, self.config.timeout) {
        Attempt::Done(output) => {
          debug!(
            "小批次 {} 由工作进程 {} 完成, 耗时: {:.2?}",
            pending.batch.id(),
            handle.id,
            now.elapsed()
          );
          worker = Some(handle);
          self.complete(pending, output)?;
        }
        Attempt::Failed(reason) => {
          worker = Some(handle);
          self.attempt_failed(pending, reason)?;
        }
        Attempt::Lost(reason) => {
          warn!("放弃工作进程 {}: {}", handle.id, reason);
          drop(handle);
          self.attempt_failed(pending, reason)?;
        }
      }
    }
    debug!("调度槽 {} 退出", slot);
    Ok(())
  }
}

/// 在本地模拟批量推理平台：切分输入、派发小批次、重试、汇总结果
pub struct Host {
  config: HostConfig,
  cancel: CancelToken,
}

impl Host {
  pub fn new(config: HostConfig) -> Self {
    Self {
      config,
      cancel: CancelToken::new(),
    }
  }

  pub fn config(&self) -> &HostConfig {
    &self.config
  }

  pub fn cancel_token(&self) -> CancelToken {
    self.cancel.clone()
  }

  pub fn run_job<C: ScoringCallback>(
    &self,
    callback: C,
    items: Vec<PathBuf>,
  ) -> Result<JobReport, HostError> {
    if self.config.workers == 0 {
      return Err(ConfigError::Invalid("工作进程数必须大于 0".into()).into());
    }

    let started_at = Utc::now();
    let now = Instant::now();
    let callback = Arc::new(callback);
    let mode = callback.output_mode();
    let total_items = items.len();
    let mut env = self.config.env.clone();
    if mode == OutputMode::WriteOwn && env.input_root.is_none() {
      env.input_root = common_root(&items);
    }
    let batches = partition(items, self.config.mini_batch_size);
    let total_batches = batches.len();
    info!(
      "开始作业: {} 个条目, {} 个小批次, 输出模式 {:?}",
      total_items, total_batches, mode
    );

    let output_dir = &self.config.output_dir;
    std::fs::create_dir_all(output_dir).map_err(OutputError::io(output_dir))?;
    // 写出模式由回调自己写文件，主机不再汇总记录
    let action = match mode {
      OutputMode::Records => self.config.output_action,
      OutputMode::WriteOwn => OutputAction::SummaryOnly,
    };
    let output = OutputWrapper::from_action(action, output_dir, &self.config.output_file_name)?;
    let output_file = match &output {
      OutputWrapper::AppendRow(rows) => Some(rows.path().to_path_buf()),
      OutputWrapper::SummaryOnly => None,
    };

    if mode == OutputMode::WriteOwn && env.output_dir.is_none() {
      env.output_dir = Some(output_dir.clone());
    }

    let slots = self.config.workers.min(total_batches);
    let shared = Shared {
      state: Mutex::new(JobState::new(batches, slots)),
      wake: Condvar::new(),
      output,
      config: &self.config,
      env,
      cancel: &self.cancel,
      next_worker_id: AtomicUsize::new(0),
    };

    let results: Vec<Result<(), HostError>> = thread::scope(|s| {
      let handles: Vec<_> = (0..slots)
        .map(|slot| {
          let shared = &shared;
          let callback = &callback;
          s.spawn(move || shared.run_slot(slot, callback))
        })
        .collect();
      handles
        .into_iter()
        .map(|h| h.join().unwrap_or(Err(HostError::SlotPanicked)))
        .collect()
    });
    for result in results {
      result?;
    }

    if let Err(e) = shared.output.finish() {
      error!("结果文件落盘失败: {}", e);
      let mut state = shared.lock()?;
      if state.stop.is_none() {
        state.stop = Some(StopReason::Output(e.to_string()));
      }
    }
    let state = shared
      .state
      .into_inner()
      .map_err(|_| HostError::Poisoned)?;

    let unprocessed_batches = state.queue.len();
    let (status, reason) = match &state.stop {
      Some(stop) => (JobStatus::Failed, Some(stop.describe())),
      None if unprocessed_batches > 0 && self.cancel.is_canceled() => {
        (JobStatus::Canceled, Some("作业被取消".to_string()))
      }
      None => (JobStatus::Completed, None),
    };

    let report = JobReport {
      status,
      reason,
      total_items,
      total_batches,
      succeeded_batches: state.succeeded,
      failed_batches: state.failed,
      unprocessed_batches,
      scored_items: state.scored_items,
      failed_items: state.failed_items,
      skipped_items: state.skipped,
      retries: state.retries,
      worker_starts: state.worker_starts,
      worker_init_failures: state.init_failures,
      schema: state.schema,
      output_file,
      started_at,
      finished_at: Utc::now(),
      elapsed_secs: now.elapsed().as_secs_f64(),
    };

    info!(
      "作业结束: {:?}, 成功 {} / {} 个小批次, 失败条目 {}, 耗时: {:.2?}",
      report.status,
      report.succeeded_batches,
      report.total_batches,
      report.failed_items,
      now.elapsed()
    );
    write_job_summary(output_dir, &report)?;
    Ok(report)
  }
}
