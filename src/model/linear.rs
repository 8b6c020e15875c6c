// 该文件是 Piliang （批量推理） 项目的一部分。
// src/model/linear.rs - 线性模型
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

use tracing::{debug, error};

use crate::{
  frame::{NchwTensor, RGB_CHANNELS},
  model::{ImageClassifierSpec, Model, ModelError, TabularSpec},
};

/// 全连接层: `out = W · x + b`
#[derive(Debug, Clone)]
pub struct LinearLayer {
  weights: Box<[Box<[f32]>]>,
  bias: Box<[f32]>,
  in_features: usize,
}

impl LinearLayer {
  pub fn new(weights: Vec<Vec<f32>>, bias: Vec<f32>, in_features: usize) -> Result<Self, ModelError> {
    if weights.is_empty() {
      return Err(ModelError::Invalid("权重矩阵为空".into()));
    }
    if weights.len() != bias.len() {
      error!(
        "权重行数 {} 与偏置长度 {} 不一致",
        weights.len(),
        bias.len()
      );
      return Err(ModelError::Invalid(format!(
        "权重行数 {} 与偏置长度 {} 不一致",
        weights.len(),
        bias.len()
      )));
    }
    if let Some((row, w)) = weights
      .iter()
      .enumerate()
      .find(|(_, w)| w.len() != in_features)
    {
      return Err(ModelError::Invalid(format!(
        "权重第 {} 行长度为 {}, 期望 {}",
        row,
        w.len(),
        in_features
      )));
    }

    if weights.iter().flatten().chain(&bias).any(|v| !v.is_finite()) {
      return Err(ModelError::Invalid("权重或偏置包含非有限数值".into()));
    }

    Ok(Self {
      weights: weights.into_iter().map(Vec::into_boxed_slice).collect(),
      bias: bias.into_boxed_slice(),
      in_features,
    })
  }

  pub fn in_features(&self) -> usize {
    self.in_features
  }

  pub fn out_features(&self) -> usize {
    self.bias.len()
  }

  pub fn forward(&self, input: &[f32]) -> Result<Box<[f32]>, ModelError> {
    if input.len() != self.in_features {
      return Err(ModelError::ShapeMismatch {
        expected: self.in_features,
        found: input.len(),
      });
    }
    let output: Box<[f32]> = self
      .weights
      .iter()
      .zip(self.bias.iter())
      .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b)
      .collect();
    // 溢出后的 inf 经过 softmax 会变成 NaN 概率
    if let Some((index, value)) = output.iter().enumerate().find(|(_, v)| !v.is_finite()) {
      error!("第 {} 个输出溢出: {}", index, value);
      return Err(ModelError::NonFinite {
        index,
        value: *value,
      });
    }
    Ok(output)
  }
}

fn softmax(logits: &mut [f32]) {
  let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let mut sum = 0.0;
  for v in logits.iter_mut() {
    *v = (*v - max).exp();
    sum += *v;
  }
  for v in logits.iter_mut() {
    *v /= sum;
  }
}

/// 第一个最大值的下标
fn argmax(values: &[f32]) -> usize {
  let mut best = 0;
  for (i, v) in values.iter().enumerate() {
    if *v > values[best] {
      best = i;
    }
  }
  best
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
  pub class: u32,
  pub probability: f32,
}

#[derive(Debug, Clone)]
pub struct ImageClassifier {
  layer: LinearLayer,
  width: u32,
  height: u32,
  mean: [f32; 3],
  std: [f32; 3],
  labels: Box<[String]>,
}

impl ImageClassifier {
  pub fn from_spec(spec: ImageClassifierSpec) -> Result<Self, ModelError> {
    if spec.width == 0 || spec.height == 0 {
      return Err(ModelError::Invalid("输入尺寸必须大于 0".into()));
    }
    if spec.std.iter().any(|s| *s == 0.0) {
      return Err(ModelError::Invalid("归一化标准差不能为 0".into()));
    }
    if spec.mean.iter().chain(&spec.std).any(|v| !v.is_finite()) {
      return Err(ModelError::Invalid("归一化参数包含非有限数值".into()));
    }

    let in_features = RGB_CHANNELS * spec.width as usize * spec.height as usize;
    let layer = LinearLayer::new(spec.weights, spec.bias, in_features)?;

    if !spec.labels.is_empty() && spec.labels.len() != layer.out_features() {
      return Err(ModelError::Invalid(format!(
        "标签数量 {} 与类别数量 {} 不一致",
        spec.labels.len(),
        layer.out_features()
      )));
    }

    debug!(
      "图像分类模型: 输入 {}x{}, 类别数 {}",
      spec.width,
      spec.height,
      layer.out_features()
    );

    Ok(Self {
      layer,
      width: spec.width,
      height: spec.height,
      mean: spec.mean,
      std: spec.std,
      labels: spec.labels.into_boxed_slice(),
    })
  }

  pub fn input_size(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  pub fn mean(&self) -> [f32; 3] {
    self.mean
  }

  pub fn std(&self) -> [f32; 3] {
    self.std
  }

  pub fn num_classes(&self) -> usize {
    self.layer.out_features()
  }

  pub fn has_labels(&self) -> bool {
    !self.labels.is_empty()
  }

  pub fn label(&self, class: u32) -> Option<&str> {
    self.labels.get(class as usize).map(String::as_str)
  }
}

impl Model for ImageClassifier {
  type Input = NchwTensor;
  type Output = Classification;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    if input.width() != self.width as usize || input.height() != self.height as usize {
      return Err(ModelError::ShapeMismatch {
        expected: self.layer.in_features(),
        found: input.len(),
      });
    }
    let raw = self.layer.forward(input.as_ref())?;
    Ok(self.postprocess(raw))
  }

  fn postprocess(&self, mut raw: Box<[f32]>) -> Self::Output {
    softmax(&mut raw);
    let class = argmax(&raw);
    Classification {
      class: class as u32,
      probability: raw[class].clamp(0.0, 1.0),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularTask {
  Regression,
  Classification,
}

/// 按特征列名取值的表格模型，每行输出一个预测值
#[derive(Debug, Clone)]
pub struct TabularModel {
  layer: LinearLayer,
  features: Box<[String]>,
  task: TabularTask,
}

impl TabularModel {
  pub fn from_spec(spec: TabularSpec, task: TabularTask) -> Result<Self, ModelError> {
    if spec.features.is_empty() {
      return Err(ModelError::Invalid("特征列为空".into()));
    }
    let layer = LinearLayer::new(spec.weights, spec.bias, spec.features.len())?;
    if task == TabularTask::Regression && layer.out_features() != 1 {
      return Err(ModelError::Invalid(format!(
        "回归模型只能有 1 个输出, 实际为 {}",
        layer.out_features()
      )));
    }

    Ok(Self {
      layer,
      features: spec.features.into_boxed_slice(),
      task,
    })
  }

  pub fn features(&self) -> &[String] {
    &self.features
  }

  pub fn task(&self) -> TabularTask {
    self.task
  }
}

impl Model for TabularModel {
  type Input = [f32];
  type Output = f64;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let raw = self.layer.forward(input)?;
    Ok(self.postprocess(raw))
  }

  fn postprocess(&self, raw: Box<[f32]>) -> Self::Output {
    match self.task {
      TabularTask::Regression => raw[0] as f64,
      TabularTask::Classification => argmax(&raw) as f64,
    }
  }
}
