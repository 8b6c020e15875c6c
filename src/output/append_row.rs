// 该文件是 Piliang （批量推理） 项目的一部分。
// src/output/append_row.rs - 逐行追加输出
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
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::{
  output::{OutputError, Render},
  record::{BatchOutput, BatchResults, Column, MiniBatch},
};

struct RowWriter {
  writer: csv::Writer<File>,
  header_written: bool,
  rows: usize,
}

/// 所有小批次的记录按完成顺序追加到同一个文件
pub struct AppendRowOutput {
  path: PathBuf,
  inner: Mutex<RowWriter>,
}

impl AppendRowOutput {
  pub fn create(path: &Path) -> Result<Self, OutputError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(OutputError::io(parent))?;
    }
    let file = File::create(path).map_err(OutputError::io(path))?;
    info!("创建结果文件: {}", path.display());

    Ok(Self {
      path: path.to_path_buf(),
      inner: Mutex::new(RowWriter {
        writer: csv::Writer::from_writer(file),
        header_written: false,
        rows: 0,
      }),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn rows(&self) -> Result<usize, OutputError> {
    Ok(self.inner.lock().map_err(|_| OutputError::Poisoned)?.rows)
  }

  pub fn flush(&self) -> Result<(), OutputError> {
    let mut inner = self.inner.lock().map_err(|_| OutputError::Poisoned)?;
    inner.writer.flush().map_err(OutputError::io(&self.path))
  }
}

impl Render<BatchOutput> for AppendRowOutput {
  type Error = OutputError;

  fn render_result(&self, batch: &MiniBatch, result: &BatchOutput) -> Result<(), Self::Error> {
    let BatchResults::Records(records) = &result.results else {
      return Ok(());
    };
    let Some(first) = records.first() else {
      return Ok(());
    };

    let mut inner = self.inner.lock().map_err(|_| OutputError::Poisoned)?;
    if !inner.header_written {
      let schema = first.schema();
      inner
        .writer
        .write_record(schema.columns().iter().map(Column::name))
        .map_err(OutputError::csv(&self.path))?;
      inner.header_written = true;
    }
    for record in records {
      inner
        .writer
        .write_record(record.fields())
        .map_err(OutputError::csv(&self.path))?;
    }
    // 每个小批次落盘一次，中途失败时已完成的行仍然可读
    inner.writer.flush().map_err(OutputError::io(&self.path))?;
    inner.rows += records.len();

    debug!(
      "小批次 {} 追加 {} 行到 {}",
      batch.id(),
      records.len(),
      self.path.display()
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{Prediction, ResultRecord};

  fn record(name: &str, class: u32) -> ResultRecord {
    ResultRecord::new(
      Path::new(name),
      Prediction::Class {
        class,
        probability: 0.5,
      },
    )
  }

  #[test]
  fn writes_header_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("predictions.csv");
    let output = AppendRowOutput::create(&path).unwrap();

    let batch = MiniBatch::new(0, vec!["a.png".into(), "b.png".into()]);
    let result = BatchOutput::records(vec![record("a.png", 1), record("b.png", 0)], Vec::new());
    output.render_result(&batch, &result).unwrap();

    let batch = MiniBatch::new(1, vec!["c.png".into()]);
    let result = BatchOutput::records(vec![record("c.png", 2)], Vec::new());
    output.render_result(&batch, &result).unwrap();
    output.flush().unwrap();

    assert_eq!(output.rows().unwrap(), 3);
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
      text,
      "file,class,probability\na.png,1,0.500000\nb.png,0,0.500000\nc.png,2,0.500000\n"
    );
  }

  #[test]
  fn separators_in_fields_are_quoted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("predictions.csv");
    let output = AppendRowOutput::create(&path).unwrap();

    let batch = MiniBatch::new(0, vec!["dir/a,b.png".into()]);
    let result = BatchOutput::records(vec![record("dir/a,b.png", 1)], Vec::new());
    output.render_result(&batch, &result).unwrap();

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][0], "dir/a,b.png");
    assert_eq!(&rows[0][1], "1");
  }

  #[test]
  fn ignores_acknowledgments_and_empty_batches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("predictions.csv");
    let output = AppendRowOutput::create(&path).unwrap();

    let batch = MiniBatch::new(0, vec!["a.csv".into()]);
    output
      .render_result(&batch, &BatchOutput::acknowledged(vec!["a.csv".into()], Vec::new()))
      .unwrap();
    output
      .render_result(&MiniBatch::new(1, Vec::new()), &BatchOutput::records(Vec::new(), Vec::new()))
      .unwrap();
    output.flush().unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
  }
}
