// 该文件是 Piliang （批量推理） 项目的一部分。
// src/output.rs - 输出定义
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

use thiserror::Error;

use crate::config::OutputAction;
use crate::record::{BatchOutput, MiniBatch};

pub trait Render<Output> {
  type Error;
  fn render_result(&self, batch: &MiniBatch, result: &Output) -> Result<(), Self::Error>;
}

mod append_row;
pub use self::append_row::AppendRowOutput;

mod item_file;
pub use self::item_file::{item_output_path, write_columnar_snapshot, write_item_record};

mod summary;
pub use self::summary::{SUMMARY_FILE_NAME, write_job_summary};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("序列化错误 {path}: {source}")]
  Serialize {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("CSV 写入错误 {path}: {source}")]
  Csv {
    path: PathBuf,
    source: csv::Error,
  },
  #[error("输出条目无效: {0}")]
  InvalidItem(PathBuf),
  #[error("输出锁已失效")]
  Poisoned,
}

impl OutputError {
  pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  pub(crate) fn csv(path: &Path) -> impl FnOnce(csv::Error) -> OutputError + '_ {
    move |source| OutputError::Csv {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// 主机侧的结果汇总
pub enum OutputWrapper {
  AppendRow(AppendRowOutput),
  SummaryOnly,
}

impl OutputWrapper {
  pub fn from_action(
    action: OutputAction,
    output_dir: &Path,
    file_name: &str,
  ) -> Result<Self, OutputError> {
    match action {
      OutputAction::AppendRow => Ok(OutputWrapper::AppendRow(AppendRowOutput::create(
        &output_dir.join(file_name),
      )?)),
      OutputAction::SummaryOnly => Ok(OutputWrapper::SummaryOnly),
    }
  }

  pub fn finish(&self) -> Result<(), OutputError> {
    match self {
      OutputWrapper::AppendRow(output) => output.flush(),
      OutputWrapper::SummaryOnly => Ok(()),
    }
  }
}

impl Render<BatchOutput> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, batch: &MiniBatch, result: &BatchOutput) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::AppendRow(output) => output.render_result(batch, result),
      OutputWrapper::SummaryOnly => Ok(()),
    }
  }
}
