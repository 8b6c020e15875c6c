// 该文件是 Piliang （批量推理） 项目的一部分。
// src/model.rs - 模型
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
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const MODEL_FILE_NAME: &str = "model.json";

pub trait Model {
  type Input: ?Sized;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
  fn postprocess(&self, raw: Box<[f32]>) -> Self::Output;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("模型描述解析错误 {path}: {source}")]
  Manifest {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("模型类型不匹配: 期望 {expected}, 实际 {found}")]
  KindMismatch {
    expected: &'static str,
    found: &'static str,
  },
  #[error("模型无效: {0}")]
  Invalid(String),
  #[error("输入形状不匹配: 期望 {expected} 个元素, 实际 {found} 个")]
  ShapeMismatch { expected: usize, found: usize },
  #[error("第 {index} 个输出不是有限数值: {value}")]
  NonFinite { index: usize, value: f32 },
  #[error("计算设备不可用: {0}")]
  DeviceUnavailable(String),
}

/// 推理使用的计算设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
  #[default]
  Cpu,
}

impl FromStr for Device {
  type Err = ModelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "" | "auto" | "cpu" => Ok(Device::Cpu),
      other => Err(ModelError::DeviceUnavailable(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageClassifierSpec {
  pub width: u32,
  pub height: u32,
  #[serde(default)]
  pub mean: [f32; 3],
  #[serde(default = "unit_std")]
  pub std: [f32; 3],
  pub weights: Vec<Vec<f32>>,
  pub bias: Vec<f32>,
  #[serde(default)]
  pub labels: Vec<String>,
}

fn unit_std() -> [f32; 3] {
  [1.0; 3]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabularSpec {
  pub features: Vec<String>,
  pub weights: Vec<Vec<f32>>,
  pub bias: Vec<f32>,
}

/// 模型目录中 `model.json` 的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ModelManifest {
  ImageClassifier(ImageClassifierSpec),
  TabularRegressor(TabularSpec),
  TabularClassifier(TabularSpec),
}

impl ModelManifest {
  /// `model_dir` 可以是模型目录，也可以直接指向模型描述文件
  pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
    let path = if model_dir.is_dir() {
      model_dir.join(MODEL_FILE_NAME)
    } else {
      model_dir.to_path_buf()
    };

    info!("加载模型文件: {}", path.display());
    let data = std::fs::read(&path).map_err(|source| ModelError::Io {
      path: path.clone(),
      source,
    })?;
    debug!(
      "模型文件大小: {:.2} KB",
      data.len() as f64 / 1024.0
    );

    serde_json::from_slice(&data).map_err(|source| ModelError::Manifest { path, source })
  }

  pub fn kind(&self) -> &'static str {
    match self {
      ModelManifest::ImageClassifier(_) => "image-classifier",
      ModelManifest::TabularRegressor(_) => "tabular-regressor",
      ModelManifest::TabularClassifier(_) => "tabular-classifier",
    }
  }
}

mod linear;
pub use self::linear::{Classification, ImageClassifier, LinearLayer, TabularModel, TabularTask};
