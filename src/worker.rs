// 该文件是 Piliang （批量推理） 项目的一部分。
// src/worker.rs - 工作进程状态机
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

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  record::{BatchOutput, BatchResults, MiniBatch, RecordSchema},
  scorer::{OutputMode, ScoringCallback, WorkerEnv},
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Uninitialized,
  Initialized,
  Ready,
  Scoring,
  Failed,
}

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("工作进程 {worker} 初始化失败: {source}")]
  Init { worker: usize, source: BoxError },
  #[error("工作进程 {worker} 输出列不匹配: 期望 {expected}, 实际 {found}")]
  SchemaMismatch {
    worker: usize,
    expected: RecordSchema,
    found: RecordSchema,
  },
  #[error("工作进程 {worker} 状态错误: 当前为 {state:?}")]
  InvalidState { worker: usize, state: WorkerState },
  #[error("小批次 {batch} 评分失败: {source}")]
  Run { batch: usize, source: BoxError },
  #[error("小批次 {batch} 违反输出约定: {reason}")]
  Contract { batch: usize, reason: String },
}

/// 持有一个回调上下文的工作进程
///
/// `Uninitialized → Initialized → Ready`，之后每个小批次经过 `Scoring` 回到
/// `Ready`。初始化或校验失败进入终止状态 `Failed`；小批次失败不改变工作进程
/// 的可用性。
pub struct Worker<C: ScoringCallback> {
  id: usize,
  callback: Arc<C>,
  context: Option<C::Context>,
  schema: Option<RecordSchema>,
  state: WorkerState,
}

impl<C: ScoringCallback> Worker<C> {
  pub fn new(id: usize, callback: Arc<C>) -> Self {
    Self {
      id,
      callback,
      context: None,
      schema: None,
      state: WorkerState::Uninitialized,
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn schema(&self) -> Option<&RecordSchema> {
    self.schema.as_ref()
  }

  /// 调用 `init` 并校验输出列；`expected` 为 `None` 时接受回调声明的列
  pub fn init(
    &mut self,
    env: &WorkerEnv,
    expected: Option<&RecordSchema>,
  ) -> Result<RecordSchema, WorkerError> {
    if self.state != WorkerState::Uninitialized {
      return Err(WorkerError::InvalidState {
        worker: self.id,
        state: self.state,
      });
    }

    info!("工作进程 {} 初始化, 模型目录: {}", self.id, env.model_dir.display());
    let now = std::time::Instant::now();
    let context = match self.callback.init(env) {
      Ok(context) => context,
      Err(e) => {
        error!("工作进程 {} 初始化失败: {}", self.id, e);
        self.state = WorkerState::Failed;
        return Err(WorkerError::Init {
          worker: self.id,
          source: Box::new(e),
        });
      }
    };
    self.state = WorkerState::Initialized;

    let schema = self.callback.schema(&context);
    if let Some(expected) = expected
      && *expected != schema
    {
      error!(
        "工作进程 {} 输出列 {} 与部署要求 {} 不一致",
        self.id, schema, expected
      );
      self.state = WorkerState::Failed;
      return Err(WorkerError::SchemaMismatch {
        worker: self.id,
        expected: expected.clone(),
        found: schema,
      });
    }

    self.context = Some(context);
    self.schema = Some(schema.clone());
    self.state = WorkerState::Ready;
    info!("工作进程 {} 就绪, 耗时: {:.2?}", self.id, now.elapsed());
    Ok(schema)
  }

  /// 处理一个小批次并检查输出约定
  pub fn score(&mut self, batch: &MiniBatch) -> Result<BatchOutput, WorkerError> {
    let (Some(context), Some(schema), WorkerState::Ready) =
      (self.context.as_ref(), self.schema.as_ref(), self.state)
    else {
      return Err(WorkerError::InvalidState {
        worker: self.id,
        state: self.state,
      });
    };

    self.state = WorkerState::Scoring;
    let now = std::time::Instant::now();
    let result = self.callback.run(context, batch);
    self.state = WorkerState::Ready;

    let output = result.map_err(|e| {
      warn!("小批次 {} 评分失败: {}", batch.id(), e);
      WorkerError::Run {
        batch: batch.id(),
        source: Box::new(e),
      }
    })?;

    check_output(batch, &output, self.callback.output_mode(), schema)?;
    debug!(
      "小批次 {} 完成: {} 个结果, {} 个跳过, 耗时: {:.2?}",
      batch.id(),
      output.results.len(),
      output.skipped.len(),
      now.elapsed()
    );
    Ok(output)
  }
}

fn check_output(
  batch: &MiniBatch,
  output: &BatchOutput,
  mode: OutputMode,
  schema: &RecordSchema,
) -> Result<(), WorkerError> {
  let violation = |reason: String| WorkerError::Contract {
    batch: batch.id(),
    reason,
  };

  if output.accounted() != batch.len() {
    return Err(violation(format!(
      "输入 {} 个条目, 产生 {} 个结果和 {} 个跳过",
      batch.len(),
      output.results.len(),
      output.skipped.len()
    )));
  }

  match (&output.results, mode) {
    (BatchResults::Records(records), OutputMode::Records) => {
      for record in records {
        if !batch.contains(record.file.as_ref()) {
          return Err(violation(format!("记录 {} 不属于该小批次", record.file)));
        }
        if !record.matches(schema) {
          return Err(violation(format!(
            "记录 {} 的列 {} 与 {} 不一致",
            record.file,
            record.schema(),
            schema
          )));
        }
      }
    }
    (BatchResults::Acknowledged(items), OutputMode::WriteOwn) => {
      if let Some(item) = items.iter().find(|item| !batch.contains(item)) {
        return Err(violation(format!("确认的条目 {} 不属于该小批次", item.display())));
      }
    }
    (_, mode) => {
      return Err(violation(format!("结果类型与输出模式 {:?} 不一致", mode)));
    }
  }

  if let Some(skipped) = output.skipped.iter().find(|s| !batch.contains(&s.item)) {
    return Err(violation(format!(
      "跳过的条目 {} 不属于该小批次",
      skipped.item.display()
    )));
  }

  Ok(())
}
