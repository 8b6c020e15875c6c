// 该文件是 Piliang （批量推理） 项目的一部分。
// src/input/read_table_file.rs - 表格文件输入
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

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use crate::input::InputError;

/// 带表头的 CSV 表格，单元格保留原始文本，特征列在取用时才解析为数值
#[derive(Debug, Clone)]
pub struct Table {
  path: PathBuf,
  columns: Vec<String>,
  rows: Vec<StringRecord>,
}

impl Table {
  pub fn read(path: &Path) -> Result<Self, InputError> {
    let text = std::fs::read_to_string(path).map_err(|source| InputError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let table = Self::parse(path, &text)?;
    debug!(
      "读取表格 {}: {} 列, {} 行",
      path.display(),
      table.columns.len(),
      table.rows.len()
    );
    Ok(table)
  }

  pub fn parse(path: &Path, text: &str) -> Result<Self, InputError> {
    let table_err = |line: usize, reason: String| InputError::Table {
      path: path.to_path_buf(),
      line,
      reason,
    };
    let csv_err = |e: csv::Error| {
      let line = e.position().map(|p| p.line() as usize).unwrap_or(0);
      table_err(line, e.to_string())
    };

    let mut reader = ReaderBuilder::new()
      .has_headers(true)
      .trim(Trim::All)
      .from_reader(text.as_bytes());

    let header = reader.headers().map_err(csv_err)?;
    if header.is_empty() {
      return Err(table_err(1, "缺少表头".to_string()));
    }
    let columns: Vec<String> = header.iter().map(str::to_string).collect();
    let mut seen = HashSet::new();
    if let Some(duplicate) = columns.iter().find(|c| !seen.insert(c.as_str())) {
      return Err(table_err(1, format!("重复的列名 '{}'", duplicate)));
    }

    let rows = reader
      .records()
      .collect::<Result<Vec<_>, _>>()
      .map_err(csv_err)?;

    Ok(Self {
      path: path.to_path_buf(),
      columns,
      rows,
    })
  }

  pub fn columns(&self) -> &[String] {
    &self.columns
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  /// 第 `index` 列的原始文本
  pub fn column_at(&self, index: usize) -> impl Iterator<Item = &str> + Clone + '_ {
    self.rows.iter().map(move |row| row.get(index).unwrap_or_default())
  }

  pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &str> + '_> {
    let index = self.columns.iter().position(|c| c == name)?;
    Some(self.column_at(index))
  }

  /// 按列名顺序取出每一行的特征，只有这些列需要是数值
  pub fn select(&self, features: &[String]) -> Result<Vec<Vec<f32>>, InputError> {
    let indices = features
      .iter()
      .map(|name| {
        self
          .columns
          .iter()
          .position(|c| c == name)
          .ok_or_else(|| InputError::MissingColumn {
            path: self.path.clone(),
            column: name.clone(),
          })
      })
      .collect::<Result<Vec<_>, _>>()?;

    self
      .rows
      .iter()
      .map(|row| {
        indices
          .iter()
          .zip(features)
          .map(|(&i, name)| {
            let cell = row.get(i).unwrap_or_default();
            cell.parse::<f32>().map_err(|_| InputError::Table {
              path: self.path.clone(),
              line: row.position().map(|p| p.line() as usize).unwrap_or(0),
              reason: format!("列 '{}' 无法解析数值 '{}'", name, cell),
            })
          })
          .collect()
      })
      .collect()
  }
}
