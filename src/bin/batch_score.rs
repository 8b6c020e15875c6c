// 该文件是 Piliang （批量推理） 项目的一部分。
// src/bin/batch_score.rs - 本地批量评分作业
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use piliang::{
  FromUrl,
  config::{DeploymentConfig, ItemFailurePolicy, OutputAction},
  host::{Host, HostConfig, JobReport, JobStatus},
  input::InputWrapper,
  scorer::{OutputMode, TabularScorer, WorkerEnv},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TaskKind {
  ImageClassifier,
  Tabular,
}

/// Piliang 批量评分
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，包含 model.json
  #[arg(long, value_name = "MODEL", env = "PILIANG_MODEL_DIR")]
  pub model: PathBuf,
  /// 输入来源: folder:///dir?ext=png 或 file:///path
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出目录
  #[arg(long, value_name = "OUTPUT", env = "PILIANG_OUTPUT_DIR")]
  pub output: PathBuf,
  /// 部署配置文件 (TOML)
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
  /// 评分任务
  #[arg(long, value_enum, default_value_t = TaskKind::ImageClassifier)]
  pub task: TaskKind,
  /// 回调输出模式，缺省时图像为 records，表格为 write-own
  #[arg(long, value_enum)]
  pub mode: Option<OutputMode>,
  /// 计算设备
  #[arg(long, env = "PILIANG_DEVICE", default_value = "auto")]
  pub device: String,

  #[arg(long)]
  pub mini_batch_size: Option<usize>,
  #[arg(long)]
  pub instance_count: Option<usize>,
  #[arg(long)]
  pub max_concurrency_per_instance: Option<usize>,
  #[arg(long)]
  pub max_retries: Option<u32>,
  #[arg(long)]
  pub timeout_secs: Option<u64>,
  /// 工作进程初始化时限，缺省时一直等待
  #[arg(long)]
  pub init_timeout_secs: Option<u64>,
  /// 允许失败的条目数，-1 表示不限制
  #[arg(long, allow_hyphen_values = true)]
  pub error_threshold: Option<i64>,
  #[arg(long, value_enum)]
  pub output_action: Option<OutputAction>,
  #[arg(long)]
  pub output_file_name: Option<String>,
  #[arg(long, value_enum)]
  pub item_failure_policy: Option<ItemFailurePolicy>,
}

impl Args {
  fn deployment(&self) -> Result<DeploymentConfig> {
    let mut deployment = match &self.config {
      Some(path) => DeploymentConfig::from_toml_file(path)?,
      None => DeploymentConfig::default(),
    };

    if let Some(size) = self.mini_batch_size {
      deployment.mini_batch_size = size;
    }
    if let Some(count) = self.instance_count {
      deployment.instance_count = count;
    }
    if let Some(count) = self.max_concurrency_per_instance {
      deployment.max_concurrency_per_instance = count;
    }
    if let Some(retries) = self.max_retries {
      deployment.retry_settings.max_retries = retries;
    }
    if let Some(secs) = self.timeout_secs {
      deployment.retry_settings.timeout_secs = secs;
    }
    if let Some(secs) = self.init_timeout_secs {
      deployment.retry_settings.init_timeout_secs = Some(secs);
    }
    if let Some(threshold) = self.error_threshold {
      deployment.error_threshold = threshold;
    }
    if let Some(action) = self.output_action {
      deployment.output_action = action;
    }
    if let Some(name) = &self.output_file_name {
      deployment.output_file_name = name.clone();
    }
    if let Some(policy) = self.item_failure_policy {
      deployment.item_failure_policy = policy;
    }

    deployment.validate()?;
    Ok(deployment)
  }
}

#[cfg(feature = "read_image_file")]
fn image_classifier(
  host: &Host,
  mode: OutputMode,
  policy: ItemFailurePolicy,
  items: Vec<PathBuf>,
) -> Result<JobReport> {
  let scorer = piliang::scorer::ImageClassifierScorer::new(mode, policy);
  Ok(host.run_job(scorer, items)?)
}

#[cfg(not(feature = "read_image_file"))]
fn image_classifier(
  _host: &Host,
  _mode: OutputMode,
  _policy: ItemFailurePolicy,
  _items: Vec<PathBuf>,
) -> Result<JobReport> {
  anyhow::bail!("图像分类需要启用 read_image_file 特性")
}

fn main() -> Result<()> {
  let args = Args::parse();
  let deployment = args.deployment()?;

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(&deployment.logging_level));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  info!("模型目录: {}", args.model.display());
  info!("输入来源: {}", args.input);
  info!("输出目录: {}", args.output.display());
  info!(
    "部署: 小批次 {}, 工作进程 {}, 重试 {}, 超时 {:?}",
    deployment.mini_batch_size,
    deployment.workers(),
    deployment.retry_settings.max_retries,
    deployment.timeout()
  );

  let items = InputWrapper::from_url(&args.input)?.into_items();
  let env = WorkerEnv::new(&args.model).with_device(&args.device);
  let host = Host::new(HostConfig::from_deployment(&deployment, env, &args.output)?);

  let cancel = host.cancel_token();
  ctrlc::set_handler(move || {
    warn!("收到中断信号，停止派发新的小批次...");
    cancel.cancel();
  })?;

  let policy = deployment.item_failure_policy;
  let report = match args.task {
    TaskKind::ImageClassifier => {
      let mode = args.mode.unwrap_or(OutputMode::Records);
      image_classifier(&host, mode, policy, items)?
    }
    TaskKind::Tabular => {
      let mode = args.mode.unwrap_or(OutputMode::WriteOwn);
      host.run_job(TabularScorer::new(mode, policy), items)?
    }
  };

  info!(
    "评分条目 {}, 失败条目 {}, 重试 {} 次, 耗时 {:.2} 秒",
    report.scored_items, report.failed_items, report.retries, report.elapsed_secs
  );
  if let Some(path) = &report.output_file {
    info!("结果文件: {}", path.display());
  }

  match report.status {
    JobStatus::Completed => Ok(()),
    status => anyhow::bail!(
      "作业未完成: {:?} {}",
      status,
      report.reason.unwrap_or_default()
    ),
  }
}
