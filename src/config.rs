// 该文件是 Piliang （批量推理） 项目的一部分。
// src/config.rs - 部署配置
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
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::record::RecordSchema;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("配置文件解析错误: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 结果汇总方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputAction {
  /// 将每条记录追加到同一个输出文件
  #[default]
  AppendRow,
  /// 只保留作业摘要
  SummaryOnly,
}

/// 小批次内单个条目失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ItemFailurePolicy {
  /// 任一条目失败即整个小批次失败，由主机决定是否重试
  #[default]
  FailBatch,
  /// 记录失败条目并继续处理其余条目
  SkipItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub max_retries: u32,
  /// 单个小批次一次尝试的时限
  pub timeout_secs: u64,
  /// 工作进程初始化的时限，未设置时一直等待
  pub init_timeout_secs: Option<u64>,
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      timeout_secs: 30,
      init_timeout_secs: None,
    }
  }
}

/// 批量部署定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
  pub mini_batch_size: usize,
  pub instance_count: usize,
  pub max_concurrency_per_instance: usize,
  pub retry_settings: RetrySettings,
  /// 允许失败的条目数，-1 表示不限制
  pub error_threshold: i64,
  pub output_action: OutputAction,
  pub output_file_name: String,
  pub item_failure_policy: ItemFailurePolicy,
  pub logging_level: String,
  pub schema: Option<RecordSchema>,
}

impl Default for DeploymentConfig {
  fn default() -> Self {
    Self {
      mini_batch_size: 10,
      instance_count: 1,
      max_concurrency_per_instance: 1,
      retry_settings: RetrySettings::default(),
      error_threshold: -1,
      output_action: OutputAction::AppendRow,
      output_file_name: "predictions.csv".to_string(),
      item_failure_policy: ItemFailurePolicy::FailBatch,
      logging_level: "info".to_string(),
      schema: None,
    }
  }
}

impl DeploymentConfig {
  pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
    debug!("读取部署配置: {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&text)
  }

  pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
    let config: DeploymentConfig = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.mini_batch_size == 0 {
      return Err(ConfigError::Invalid("mini_batch_size 必须大于 0".into()));
    }
    if self.instance_count == 0 || self.max_concurrency_per_instance == 0 {
      return Err(ConfigError::Invalid(
        "instance_count 与 max_concurrency_per_instance 必须大于 0".into(),
      ));
    }
    if self
      .instance_count
      .checked_mul(self.max_concurrency_per_instance)
      .is_none()
    {
      return Err(ConfigError::Invalid(format!(
        "instance_count {} 与 max_concurrency_per_instance {} 的乘积溢出",
        self.instance_count, self.max_concurrency_per_instance
      )));
    }
    if self.retry_settings.timeout_secs == 0 {
      return Err(ConfigError::Invalid("timeout_secs 必须大于 0".into()));
    }
    if self.retry_settings.init_timeout_secs == Some(0) {
      return Err(ConfigError::Invalid("init_timeout_secs 必须大于 0".into()));
    }
    if self.error_threshold < -1 {
      return Err(ConfigError::Invalid(format!(
        "error_threshold 不能小于 -1，实际为 {}",
        self.error_threshold
      )));
    }
    if self.output_file_name.trim().is_empty() {
      return Err(ConfigError::Invalid("output_file_name 不能为空".into()));
    }
    Ok(())
  }

  /// 同时运行的工作进程数量
  pub fn workers(&self) -> usize {
    self
      .instance_count
      .saturating_mul(self.max_concurrency_per_instance)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.retry_settings.timeout_secs)
  }

  pub fn init_timeout(&self) -> Option<Duration> {
    self.retry_settings.init_timeout_secs.map(Duration::from_secs)
  }
}
