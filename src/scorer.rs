// 该文件是 Piliang （批量推理） 项目的一部分。
// src/scorer.rs - 小批次评分回调
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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  config::ItemFailurePolicy,
  input::InputError,
  model::ModelError,
  output::OutputError,
  record::{BatchOutput, MiniBatch, RecordSchema, SkippedItem},
};

#[cfg(feature = "read_image_file")]
mod image_classifier;
#[cfg(feature = "read_image_file")]
pub use self::image_classifier::{ImageClassifierContext, ImageClassifierScorer};

mod tabular;
pub use self::tabular::{TabularContext, TabularScorer};

pub const MODEL_DIR_ENV: &str = "PILIANG_MODEL_DIR";
pub const OUTPUT_DIR_ENV: &str = "PILIANG_OUTPUT_DIR";
pub const DEVICE_ENV: &str = "PILIANG_DEVICE";
pub const INPUT_ROOT_ENV: &str = "PILIANG_INPUT_ROOT";

/// 回调结果的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
  /// `run` 返回记录，由主机汇总
  #[default]
  Records,
  /// `run` 自行把每个条目的结果写入输出目录，只返回确认
  WriteOwn,
}

#[derive(Error, Debug)]
pub enum ScoreError {
  #[error("模型错误: {0}")]
  Model(#[from] ModelError),
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("缺少环境变量: {0}")]
  MissingEnv(&'static str),
  #[error("{scorer} 不支持输出模式 {mode:?}")]
  UnsupportedOutputMode {
    scorer: &'static str,
    mode: OutputMode,
  },
  #[error("写出模式需要输出目录")]
  MissingOutputDir,
}

/// 主机在工作进程启动时提供的环境
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
  pub model_dir: PathBuf,
  pub output_dir: Option<PathBuf>,
  /// 写出模式下结果文件按条目相对该目录的路径命名
  pub input_root: Option<PathBuf>,
  pub device: String,
}

impl WorkerEnv {
  pub fn new(model_dir: impl Into<PathBuf>) -> Self {
    Self {
      model_dir: model_dir.into(),
      output_dir: None,
      input_root: None,
      device: "auto".to_string(),
    }
  }

  pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
    self.output_dir = Some(output_dir.into());
    self
  }

  pub fn with_input_root(mut self, input_root: impl Into<PathBuf>) -> Self {
    self.input_root = Some(input_root.into());
    self
  }

  pub fn with_device(mut self, device: impl Into<String>) -> Self {
    self.device = device.into();
    self
  }

  /// 从进程环境变量读取
  pub fn from_env() -> Result<Self, ScoreError> {
    let model_dir = std::env::var_os(MODEL_DIR_ENV).ok_or(ScoreError::MissingEnv(MODEL_DIR_ENV))?;
    let mut env = WorkerEnv::new(model_dir);
    if let Some(output_dir) = std::env::var_os(OUTPUT_DIR_ENV) {
      env = env.with_output_dir(output_dir);
    }
    if let Some(input_root) = std::env::var_os(INPUT_ROOT_ENV) {
      env = env.with_input_root(input_root);
    }
    if let Ok(device) = std::env::var(DEVICE_ENV) {
      env = env.with_device(device);
    }
    Ok(env)
  }
}

/// 由主机驱动的两段式评分约定
///
/// `init` 在每个工作进程中只调用一次，返回的上下文在工作进程的整个生命周期内
/// 以只读方式传给每次 `run`。`init` 失败会使工作进程失效；`run` 失败只影响
/// 当前小批次，是否重试由主机决定。
pub trait ScoringCallback: Send + Sync + 'static {
  type Context;
  type Error: std::error::Error + Send + Sync + 'static;

  fn output_mode(&self) -> OutputMode;
  fn init(&self, env: &WorkerEnv) -> Result<Self::Context, Self::Error>;
  fn run(&self, context: &Self::Context, batch: &MiniBatch) -> Result<BatchOutput, Self::Error>;
  fn schema(&self, context: &Self::Context) -> RecordSchema;
}

/// 逐条目处理小批次，按 `policy` 决定失败条目是跳过还是让整个小批次失败
pub fn score_items<T, E, F>(
  batch: &MiniBatch,
  policy: ItemFailurePolicy,
  mut score: F,
) -> Result<(Vec<T>, Vec<SkippedItem>), E>
where
  F: FnMut(&Path) -> Result<T, E>,
  E: std::fmt::Display,
{
  let mut results = Vec::with_capacity(batch.len());
  let mut skipped = Vec::new();

  for item in batch.items() {
    match score(item) {
      Ok(result) => results.push(result),
      Err(e) => match policy {
        ItemFailurePolicy::FailBatch => {
          error!("小批次 {} 条目 {} 处理失败: {}", batch.id(), item.display(), e);
          return Err(e);
        }
        ItemFailurePolicy::SkipItem => {
          warn!("跳过条目 {}: {}", item.display(), e);
          skipped.push(SkippedItem {
            item: item.clone(),
            reason: e.to_string(),
          });
        }
      },
    }
  }

  Ok((results, skipped))
}

/// 写出模式下确保输出目录存在
fn prepare_output_dir(mode: OutputMode, env: &WorkerEnv) -> Result<Option<PathBuf>, ScoreError> {
  match mode {
    OutputMode::Records => Ok(None),
    OutputMode::WriteOwn => {
      let dir = env.output_dir.clone().ok_or(ScoreError::MissingOutputDir)?;
      std::fs::create_dir_all(&dir).map_err(OutputError::io(&dir))?;
      info!("输出目录: {}", dir.display());
      Ok(Some(dir))
    }
  }
}
