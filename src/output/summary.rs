// 该文件是 Piliang （批量推理） 项目的一部分。
// src/output/summary.rs - 作业摘要
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

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::{host::JobReport, output::OutputError};

pub const SUMMARY_FILE_NAME: &str = "job_summary.json";

pub fn write_job_summary(output_dir: &Path, report: &JobReport) -> Result<PathBuf, OutputError> {
  std::fs::create_dir_all(output_dir).map_err(OutputError::io(output_dir))?;
  let path = output_dir.join(SUMMARY_FILE_NAME);
  let file = File::create(&path).map_err(OutputError::io(&path))?;
  let mut writer = BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, report).map_err(|source| {
    OutputError::Serialize {
      path: path.clone(),
      source,
    }
  })?;
  writer.flush().map_err(OutputError::io(&path))?;
  info!("作业摘要已写入: {}", path.display());
  Ok(path)
}
