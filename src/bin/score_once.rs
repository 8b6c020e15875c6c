// 该文件是 Piliang （批量推理） 项目的一部分。
// src/bin/score_once.rs - 在单个工作进程中直接运行评分回调
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

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use piliang::{
  FromUrl,
  config::ItemFailurePolicy,
  input::InputWrapper,
  record::{BatchResults, common_root, partition},
  scorer::{OutputMode, ScoringCallback, TabularScorer, WorkerEnv},
  worker::Worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TaskKind {
  ImageClassifier,
  Tabular,
}

/// 模型目录、输出目录与设备从 PILIANG_* 环境变量读取
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  #[arg(long, value_enum, default_value_t = TaskKind::ImageClassifier)]
  pub task: TaskKind,
  #[arg(long, value_enum)]
  pub mode: Option<OutputMode>,
  #[arg(long, value_enum, default_value_t = ItemFailurePolicy::FailBatch)]
  pub item_failure_policy: ItemFailurePolicy,
  #[arg(long, default_value = "10")]
  pub mini_batch_size: usize,
}

fn score_all<C: ScoringCallback>(
  callback: C,
  env: &WorkerEnv,
  items: Vec<PathBuf>,
  mini_batch_size: usize,
) -> Result<()> {
  let mut worker = Worker::new(0, Arc::new(callback));
  let schema = worker.init(env, None)?;
  info!("输出列: {}", schema);

  let stdout = std::io::stdout();
  let mut out = stdout.lock();
  for batch in partition(items, mini_batch_size) {
    let now = std::time::Instant::now();
    let output = worker.score(&batch)?;
    info!("小批次 {} 完成，耗时: {:.2?}", batch.id(), now.elapsed());

    match &output.results {
      BatchResults::Records(records) => {
        for record in records {
          serde_json::to_writer(&mut out, record)?;
          writeln!(out)?;
        }
      }
      BatchResults::Acknowledged(items) => {
        for item in items {
          writeln!(out, "{}", item.display())?;
        }
      }
    }
    for skipped in &output.skipped {
      warn!("跳过 {}: {}", skipped.item.display(), skipped.reason);
    }
  }
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  let mut env = WorkerEnv::from_env()?;
  info!("模型目录: {}", env.model_dir.display());
  info!("输入来源: {}", args.input);

  let items = InputWrapper::from_url(&args.input)?.into_items();
  if env.input_root.is_none() {
    env.input_root = common_root(&items);
  }
  let policy = args.item_failure_policy;
  match args.task {
    #[cfg(feature = "read_image_file")]
    TaskKind::ImageClassifier => {
      let mode = args.mode.unwrap_or(OutputMode::Records);
      let scorer = piliang::scorer::ImageClassifierScorer::new(mode, policy);
      score_all(scorer, &env, items, args.mini_batch_size)
    }
    #[cfg(not(feature = "read_image_file"))]
    TaskKind::ImageClassifier => anyhow::bail!("图像分类需要启用 read_image_file 特性"),
    TaskKind::Tabular => {
      let mode = args.mode.unwrap_or(OutputMode::WriteOwn);
      score_all(TabularScorer::new(mode, policy), &env, items, args.mini_batch_size)
    }
  }
}
