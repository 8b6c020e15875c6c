// 该文件是 Piliang （批量推理） 项目的一部分。
// tests/host.rs - 主机调度、重试、超时与阈值
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

mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use piliang::{
  config::{ItemFailurePolicy, OutputAction},
  host::{Host, HostError, JobStatus},
  output::SUMMARY_FILE_NAME,
  record::{BatchOutput, MiniBatch, Prediction, RecordSchema, ResultRecord},
  scorer::{OutputMode, ScoringCallback, WorkerEnv, score_items},
};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct FakeError(String);

/// 以路径长度作为预测值；可以按小批次注入失败或延迟
#[derive(Default)]
struct FakeScorer {
  policy: ItemFailurePolicy,
  inits: AtomicUsize,
  failing_inits: AtomicUsize,
  slow_inits: AtomicUsize,
  init_delay: Duration,
  failing_runs: Mutex<HashMap<usize, u32>>,
  slow_runs: Mutex<HashMap<usize, u32>>,
  delay: Duration,
  run_delay: Duration,
  /// 第奇数个初始化的工作进程改为输出分类结果
  mixed_schemas: bool,
}

impl FakeScorer {
  fn fail_runs(self, batch: usize, times: u32) -> Self {
    self.failing_runs.lock().unwrap().insert(batch, times);
    self
  }

  fn slow_runs(mut self, batch: usize, times: u32, delay: Duration) -> Self {
    self.slow_runs.lock().unwrap().insert(batch, times);
    self.delay = delay;
    self
  }

  fn fail_inits(self, times: usize) -> Self {
    self.failing_inits.store(times, Ordering::SeqCst);
    self
  }

  fn slow_inits(mut self, times: usize, delay: Duration) -> Self {
    self.slow_inits.store(times, Ordering::SeqCst);
    self.init_delay = delay;
    self
  }

  fn with_run_delay(mut self, delay: Duration) -> Self {
    self.run_delay = delay;
    self
  }

  fn with_mixed_schemas(mut self) -> Self {
    self.mixed_schemas = true;
    self
  }

  fn classifies(&self, context: &usize) -> bool {
    self.mixed_schemas && context % 2 == 1
  }

  fn with_policy(mut self, policy: ItemFailurePolicy) -> Self {
    self.policy = policy;
    self
  }

  fn take_one(counter: &AtomicUsize) -> bool {
    counter
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
  }

  fn take(map: &Mutex<HashMap<usize, u32>>, batch: usize) -> bool {
    let mut map = map.lock().unwrap();
    match map.get_mut(&batch) {
      Some(left) if *left > 0 => {
        *left -= 1;
        true
      }
      _ => false,
    }
  }
}

impl ScoringCallback for FakeScorer {
  /// 第几个完成初始化的工作进程
  type Context = usize;
  type Error = FakeError;

  fn output_mode(&self) -> OutputMode {
    OutputMode::Records
  }

  fn init(&self, _env: &WorkerEnv) -> Result<Self::Context, Self::Error> {
    if Self::take_one(&self.failing_inits) {
      return Err(FakeError("model not found".to_string()));
    }
    if Self::take_one(&self.slow_inits) {
      std::thread::sleep(self.init_delay);
    }
    Ok(self.inits.fetch_add(1, Ordering::SeqCst))
  }

  fn run(&self, context: &usize, batch: &MiniBatch) -> Result<BatchOutput, Self::Error> {
    std::thread::sleep(self.run_delay);
    if Self::take(&self.slow_runs, batch.id()) {
      std::thread::sleep(self.delay);
    }
    if Self::take(&self.failing_runs, batch.id()) {
      return Err(FakeError(format!("batch {} failed", batch.id())));
    }
    let (records, skipped) = score_items(batch, self.policy, |item: &Path| {
      let name = item.to_string_lossy();
      if name.contains("bad") {
        return Err(FakeError(format!("cannot read {}", name)));
      }
      let prediction = if self.classifies(context) {
        Prediction::Class {
          class: 0,
          probability: 1.0,
        }
      } else {
        Prediction::Value {
          value: name.len() as f64,
        }
      };
      Ok(ResultRecord::new(item, prediction))
    })?;
    Ok(BatchOutput::records(records, skipped))
  }

  fn schema(&self, context: &usize) -> RecordSchema {
    if self.classifies(context) {
      RecordSchema::classification()
    } else {
      RecordSchema::regression()
    }
  }
}

fn items(n: usize) -> Vec<PathBuf> {
  (0..n).map(|i| PathBuf::from(format!("item-{:02}.txt", i))).collect()
}

#[test]
fn all_items_are_scored_and_summarized() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 3;
  config.workers = 2;

  let report = Host::new(config).run_job(FakeScorer::default(), items(10)).unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.total_batches, 4);
  assert_eq!(report.succeeded_batches, 4);
  assert_eq!(report.scored_items, 10);
  assert_eq!(report.schema, Some(RecordSchema::regression()));

  let rows = common::read_rows(&dir.path().join("predictions.csv"));
  assert_eq!(rows[0], "file,value");
  assert_eq!(rows.len(), 11);

  let summary: serde_json::Value = serde_json::from_reader(
    std::fs::File::open(dir.path().join(SUMMARY_FILE_NAME)).unwrap(),
  )
  .unwrap();
  assert_eq!(summary["status"], "completed");
  assert_eq!(summary["scored_items"], 10);
}

#[test]
fn failed_batch_is_retried() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.max_retries = 3;

  let report = Host::new(config)
    .run_job(FakeScorer::default().fail_runs(1, 2), items(6))
    .unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.retries, 2);
  assert!(report.failed_batches.is_empty());
  assert_eq!(report.scored_items, 6);
  // 工作进程在小批次失败后继续可用
  assert_eq!(report.worker_starts, 1);
}

#[test]
fn exhausted_retries_mark_batch_failed() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.max_retries = 1;

  let report = Host::new(config)
    .run_job(FakeScorer::default().fail_runs(0, 10), items(4))
    .unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.failed_batches.len(), 1);
  let failed = &report.failed_batches[0];
  assert_eq!(failed.batch, 0);
  assert_eq!(failed.attempts, 2);
  assert_eq!(failed.items, items(2));
  assert!(failed.error.contains("batch 0 failed"));
  assert_eq!(report.failed_items, 2);
  assert_eq!(report.scored_items, 2);
}

#[test]
fn timed_out_worker_is_replaced() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.timeout = Duration::from_millis(200);

  let scorer = FakeScorer::default().slow_runs(0, 1, Duration::from_secs(1));
  let report = Host::new(config).run_job(scorer, items(4)).unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.retries, 1);
  assert_eq!(report.worker_starts, 2);
  assert_eq!(report.scored_items, 4);
}

#[test]
fn every_worker_failing_init_fails_job() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.workers = 2;

  let report = Host::new(config)
    .run_job(FakeScorer::default().fail_inits(usize::MAX), items(6))
    .unwrap();
  assert_eq!(report.status, JobStatus::Failed);
  assert_eq!(report.worker_init_failures, 2);
  assert_eq!(report.scored_items, 0);
  assert_eq!(report.failed_batches.len(), 3);
  assert_eq!(report.failed_items, 6);
}

#[test]
fn remaining_slots_absorb_init_failure() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 1;
  config.workers = 2;

  let report = Host::new(config)
    .run_job(FakeScorer::default().fail_inits(1), items(5))
    .unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.worker_init_failures, 1);
  assert_eq!(report.scored_items, 5);
  assert!(report.failed_batches.is_empty());
}

#[test]
fn skipped_items_count_against_threshold() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.error_threshold = 1;

  let mut inputs = items(6);
  inputs[1] = PathBuf::from("bad-1.txt");
  inputs[3] = PathBuf::from("bad-3.txt");

  let scorer = FakeScorer::default().with_policy(ItemFailurePolicy::SkipItem);
  let report = Host::new(config).run_job(scorer, inputs).unwrap();
  assert_eq!(report.status, JobStatus::Failed);
  assert_eq!(report.failed_items, 2);
  assert_eq!(report.skipped_items.len(), 2);
  assert_eq!(report.unprocessed_batches, 1);
}

#[test]
fn unlimited_threshold_tolerates_skips() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;

  let mut inputs = items(4);
  inputs[0] = PathBuf::from("bad-0.txt");

  let scorer = FakeScorer::default().with_policy(ItemFailurePolicy::SkipItem);
  let report = Host::new(config).run_job(scorer, inputs).unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.scored_items, 3);
  assert_eq!(report.skipped_items[0].item, PathBuf::from("bad-0.txt"));
}

#[test]
fn canceled_job_dispatches_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let config = common::host_config(Path::new("/models/fake"), dir.path());

  let host = Host::new(config);
  host.cancel_token().cancel();
  let scorer = FakeScorer::default();
  let report = host.run_job(scorer, items(25)).unwrap();
  assert_eq!(report.status, JobStatus::Canceled);
  assert_eq!(report.unprocessed_batches, 3);
  assert_eq!(report.scored_items, 0);
}

#[test]
fn empty_input_completes() {
  let dir = tempfile::tempdir().unwrap();
  let config = common::host_config(Path::new("/models/fake"), dir.path());

  let report = Host::new(config)
    .run_job(FakeScorer::default(), Vec::new())
    .unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.total_batches, 0);
  assert_eq!(report.worker_starts, 0);
  assert!(dir.path().join(SUMMARY_FILE_NAME).is_file());
}

#[test]
fn summary_only_writes_no_rows() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.output_action = OutputAction::SummaryOnly;

  let report = Host::new(config).run_job(FakeScorer::default(), items(3)).unwrap();
  assert_eq!(report.scored_items, 3);
  assert!(report.output_file.is_none());
  assert!(!dir.path().join("predictions.csv").exists());
}

#[test]
fn results_do_not_depend_on_partitioning() {
  let mut outputs = Vec::new();
  for size in [1, 4, 10] {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::host_config(Path::new("/models/fake"), dir.path());
    config.mini_batch_size = size;
    Host::new(config).run_job(FakeScorer::default(), items(10)).unwrap();

    let mut rows = common::read_rows(&dir.path().join("predictions.csv"));
    rows.sort();
    outputs.push(rows);
  }
  assert_eq!(outputs[0], outputs[1]);
  assert_eq!(outputs[1], outputs[2]);
}

#[test]
fn failed_batches_can_exceed_threshold() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.max_retries = 0;
  config.error_threshold = 1;

  let report = Host::new(config)
    .run_job(FakeScorer::default().fail_runs(0, 10), items(6))
    .unwrap();
  assert_eq!(report.status, JobStatus::Failed);
  assert!(report.reason.unwrap().contains("超过阈值"));
  assert_eq!(report.failed_batches.len(), 1);
  assert_eq!(report.failed_batches[0].attempts, 1);
  assert_eq!(report.failed_items, 2);
  assert_eq!(report.unprocessed_batches, 2);
  assert_eq!(report.scored_items, 0);
}

#[test]
fn slow_init_is_abandoned_after_init_timeout() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 1;
  config.workers = 2;
  config.init_timeout = Some(Duration::from_millis(200));

  let scorer = FakeScorer::default().slow_inits(1, Duration::from_secs(2));
  let report = Host::new(config).run_job(scorer, items(4)).unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.worker_init_failures, 1);
  assert_eq!(report.scored_items, 4);
  assert!(report.failed_batches.is_empty());
}

#[test]
fn init_is_not_bounded_by_batch_timeout() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.timeout = Duration::from_millis(200);
  config.init_timeout = None;

  let scorer = FakeScorer::default().slow_inits(1, Duration::from_millis(600));
  let report = Host::new(config).run_job(scorer, items(4)).unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.worker_init_failures, 0);
  assert_eq!(report.worker_starts, 1);
  assert_eq!(report.scored_items, 4);
}

#[test]
fn worker_with_different_schema_is_discarded() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 1;
  config.workers = 2;

  let scorer = FakeScorer::default()
    .with_mixed_schemas()
    .with_run_delay(Duration::from_millis(50));
  let report = Host::new(config).run_job(scorer, items(4)).unwrap();
  assert_eq!(report.status, JobStatus::Completed);
  assert_eq!(report.worker_init_failures, 1);
  assert_eq!(report.scored_items, 4);

  // 只有第一个就绪的工作进程的输出列进入结果文件
  let schema = report.schema.unwrap();
  let rows = common::read_rows(&dir.path().join("predictions.csv"));
  assert_eq!(rows[0], schema.header());
  assert_eq!(rows.len(), 5);
  let width = schema.columns().len();
  assert!(rows[1..].iter().all(|row| row.split(',').count() == width));
}

#[test]
fn configured_schema_rejects_every_worker() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.workers = 2;
  config.schema = Some(RecordSchema::classification());

  let report = Host::new(config).run_job(FakeScorer::default(), items(4)).unwrap();
  assert_eq!(report.status, JobStatus::Failed);
  assert_eq!(report.worker_init_failures, 2);
  assert_eq!(report.failed_items, 4);
  assert_eq!(report.scored_items, 0);
}

#[test]
fn zero_workers_is_a_config_error() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.workers = 0;

  let result = Host::new(config).run_job(FakeScorer::default(), items(3));
  assert!(matches!(result, Err(HostError::Config(_))));
}

#[cfg(target_os = "linux")]
#[test]
fn unwritable_results_fail_the_job() {
  // 写入 /dev/full 总是返回 ENOSPC
  if !Path::new("/dev/full").exists() {
    return;
  }
  let dir = tempfile::tempdir().unwrap();
  let mut config = common::host_config(Path::new("/models/fake"), dir.path());
  config.mini_batch_size = 2;
  config.output_file_name = "/dev/full".to_string();

  let report = Host::new(config).run_job(FakeScorer::default(), items(4)).unwrap();
  assert_eq!(report.status, JobStatus::Failed);
  assert!(report.reason.unwrap().contains("写入结果失败"));
  assert_eq!(report.failed_batches.len(), 1);
  assert_eq!(report.failed_items, 2);
  assert_eq!(report.unprocessed_batches, 1);
  assert_eq!(report.scored_items, 0);
  assert!(dir.path().join(SUMMARY_FILE_NAME).is_file());
}
