// 该文件是 Piliang （批量推理） 项目的一部分。
// src/record.rs - 小批次与结果记录定义
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

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// 一次回调调用处理的输入分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniBatch {
  id: usize,
  items: Box<[PathBuf]>,
}

impl MiniBatch {
  pub fn new(id: usize, items: Vec<PathBuf>) -> Self {
    Self {
      id,
      items: items.into_boxed_slice(),
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn items(&self) -> &[PathBuf] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn contains(&self, item: &Path) -> bool {
    self.items.iter().any(|p| p == item)
  }
}

/// 按固定大小切分输入，保持原有顺序。`size` 为 0 时视为 1。
pub fn partition(items: Vec<PathBuf>, size: usize) -> Vec<MiniBatch> {
  let size = size.max(1);
  let mut batches = Vec::with_capacity(items.len().div_ceil(size));
  let mut iter = items.into_iter().peekable();
  while iter.peek().is_some() {
    let chunk: Vec<PathBuf> = iter.by_ref().take(size).collect();
    batches.push(MiniBatch::new(batches.len(), chunk));
  }
  batches
}

/// 所有条目共同的最长上级目录
pub fn common_root(items: &[PathBuf]) -> Option<PathBuf> {
  let (first, rest) = items.split_first()?;
  let mut root = first.parent()?.to_path_buf();
  for item in rest {
    while !item.starts_with(&root) {
      if !root.pop() {
        return None;
      }
    }
  }
  Some(root)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Column {
  File,
  Class,
  Label,
  Probability,
  Value,
}

impl Column {
  pub fn name(&self) -> &'static str {
    match self {
      Column::File => "file",
      Column::Class => "class",
      Column::Label => "label",
      Column::Probability => "probability",
      Column::Value => "value",
    }
  }
}

/// 一个部署输出的固定列集合，在工作进程启动时校验一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordSchema {
  columns: Vec<Column>,
}

impl RecordSchema {
  pub fn new(columns: Vec<Column>) -> Self {
    Self { columns }
  }

  pub fn classification() -> Self {
    Self::new(vec![Column::File, Column::Class, Column::Probability])
  }

  pub fn labeled() -> Self {
    Self::new(vec![
      Column::File,
      Column::Class,
      Column::Label,
      Column::Probability,
    ])
  }

  pub fn regression() -> Self {
    Self::new(vec![Column::File, Column::Value])
  }

  /// 写出模式下只回传被接受的条目
  pub fn acknowledgment() -> Self {
    Self::new(vec![Column::File])
  }

  pub fn columns(&self) -> &[Column] {
    &self.columns
  }

  pub fn header(&self) -> String {
    self
      .columns
      .iter()
      .map(Column::name)
      .collect::<Vec<_>>()
      .join(",")
  }
}

impl fmt::Display for RecordSchema {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}]", self.header())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prediction {
  Class {
    class: u32,
    probability: f32,
  },
  Label {
    class: u32,
    label: String,
    probability: f32,
  },
  Value {
    value: f64,
  },
}

impl Prediction {
  fn columns(&self) -> &'static [Column] {
    match self {
      Prediction::Class { .. } => &[Column::Class, Column::Probability],
      Prediction::Label { .. } => &[Column::Class, Column::Label, Column::Probability],
      Prediction::Value { .. } => &[Column::Value],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
  pub file: String,
  #[serde(flatten)]
  pub prediction: Prediction,
}

impl ResultRecord {
  pub fn new(item: &Path, prediction: Prediction) -> Self {
    Self {
      file: item.to_string_lossy().into_owned(),
      prediction,
    }
  }

  pub fn schema(&self) -> RecordSchema {
    let mut columns = vec![Column::File];
    columns.extend_from_slice(self.prediction.columns());
    RecordSchema::new(columns)
  }

  pub fn matches(&self, schema: &RecordSchema) -> bool {
    let columns = schema.columns();
    columns.first() == Some(&Column::File) && &columns[1..] == self.prediction.columns()
  }

  /// 一行中的各字段，顺序与 [`RecordSchema::columns`] 一致
  pub fn fields(&self) -> Vec<String> {
    let mut fields = vec![self.file.clone()];
    match &self.prediction {
      Prediction::Class { class, probability } => {
        fields.push(class.to_string());
        fields.push(format!("{:.6}", probability));
      }
      Prediction::Label {
        class,
        label,
        probability,
      } => {
        fields.push(class.to_string());
        fields.push(label.clone());
        fields.push(format!("{:.6}", probability));
      }
      Prediction::Value { value } => fields.push(value.to_string()),
    }
    fields
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
  pub item: PathBuf,
  pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchResults {
  Records(Vec<ResultRecord>),
  Acknowledged(Vec<PathBuf>),
}

impl BatchResults {
  pub fn len(&self) -> usize {
    match self {
      BatchResults::Records(records) => records.len(),
      BatchResults::Acknowledged(items) => items.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// `run` 的返回值：记录或确认，以及按策略跳过的条目
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
  pub results: BatchResults,
  pub skipped: Vec<SkippedItem>,
}

impl BatchOutput {
  pub fn records(records: Vec<ResultRecord>, skipped: Vec<SkippedItem>) -> Self {
    Self {
      results: BatchResults::Records(records),
      skipped,
    }
  }

  pub fn acknowledged(items: Vec<PathBuf>, skipped: Vec<SkippedItem>) -> Self {
    Self {
      results: BatchResults::Acknowledged(items),
      skipped,
    }
  }

  /// 已产生结果与已跳过条目的总数
  pub fn accounted(&self) -> usize {
    self.results.len() + self.skipped.len()
  }
}
