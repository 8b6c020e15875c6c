// 该文件是 Piliang （批量推理） 项目的一部分。
// src/output/item_file.rs - 逐条目写出文件
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

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{input::Table, output::OutputError, record::ResultRecord};

pub const PREDICTION_COLUMN: &str = "prediction";

/// `<dir>/<条目相对 root 的路径>.json`，没有 root 时只用文件名
///
/// 保留完整文件名与子目录，`a/cat.png`、`b/cat.png` 与 `a/cat.jpg`
/// 各自得到不同的结果文件。
pub fn item_output_path(
  dir: &Path,
  root: Option<&Path>,
  item: &Path,
) -> Result<PathBuf, OutputError> {
  let invalid = || OutputError::InvalidItem(item.to_path_buf());
  let relative = match root {
    Some(root) => item.strip_prefix(root).map_err(|_| invalid())?,
    None => Path::new(item.file_name().ok_or_else(invalid)?),
  };
  if relative.as_os_str().is_empty()
    || !relative
      .components()
      .all(|c| matches!(c, Component::Normal(_)))
  {
    return Err(invalid());
  }

  let mut name = relative.as_os_str().to_os_string();
  name.push(".json");
  Ok(dir.join(name))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OutputError> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(OutputError::io(parent))?;
  }
  let file = File::create(path).map_err(OutputError::io(path))?;
  let mut writer = BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, value).map_err(|source| OutputError::Serialize {
    path: path.to_path_buf(),
    source,
  })?;
  writer.flush().map_err(OutputError::io(path))
}

pub fn write_item_record(
  dir: &Path,
  root: Option<&Path>,
  item: &Path,
  record: &ResultRecord,
) -> Result<PathBuf, OutputError> {
  let path = item_output_path(dir, root, item)?;
  write_json(&path, record)?;
  debug!("写出结果: {}", path.display());
  Ok(path)
}

#[derive(Serialize)]
struct ColumnarSnapshot<'a> {
  source: String,
  rows: usize,
  columns: Vec<&'a str>,
  data: BTreeMap<&'a str, Vec<Value>>,
}

/// 全部单元格都是有限数值的列写成数值，否则保留原始文本
fn column_values<'a>(cells: impl Iterator<Item = &'a str> + Clone) -> Vec<Value> {
  let numbers: Option<Vec<f64>> = cells
    .clone()
    .map(|cell| cell.parse::<f64>().ok().filter(|v| v.is_finite()))
    .collect();
  match numbers {
    Some(numbers) => numbers.into_iter().map(Value::from).collect(),
    None => cells.map(Value::from).collect(),
  }
}

/// 原始各列加上预测列，按列存储
pub fn write_columnar_snapshot(
  dir: &Path,
  root: Option<&Path>,
  item: &Path,
  table: &Table,
  predictions: &[f64],
) -> Result<PathBuf, OutputError> {
  if predictions.len() != table.len()
    || table.columns().iter().any(|c| c == PREDICTION_COLUMN)
  {
    return Err(OutputError::InvalidItem(item.to_path_buf()));
  }

  let mut columns: Vec<&str> = table.columns().iter().map(String::as_str).collect();
  let mut data = BTreeMap::new();
  for (index, name) in columns.iter().enumerate() {
    data.insert(*name, column_values(table.column_at(index)));
  }
  columns.push(PREDICTION_COLUMN);
  data.insert(
    PREDICTION_COLUMN,
    predictions.iter().copied().map(Value::from).collect(),
  );

  let snapshot = ColumnarSnapshot {
    source: item.to_string_lossy().into_owned(),
    rows: table.len(),
    columns,
    data,
  };

  let path = item_output_path(dir, root, item)?;
  write_json(&path, &snapshot)?;
  debug!("写出列存快照: {} ({} 行)", path.display(), table.len());
  Ok(path)
}
