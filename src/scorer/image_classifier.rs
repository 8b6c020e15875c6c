// 该文件是 Piliang （批量推理） 项目的一部分。
// src/scorer/image_classifier.rs - 图像分类评分
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

use tracing::{debug, info};

use crate::{
  config::ItemFailurePolicy,
  input::read_image_tensor,
  model::{Classification, Device, ImageClassifier, Model, ModelError, ModelManifest},
  output::write_item_record,
  record::{BatchOutput, MiniBatch, Prediction, RecordSchema, ResultRecord},
  scorer::{OutputMode, ScoreError, ScoringCallback, WorkerEnv, prepare_output_dir, score_items},
};

/// 图像分类：解码、缩放、归一化、线性层、softmax + argmax
#[derive(Debug, Clone)]
pub struct ImageClassifierScorer {
  mode: OutputMode,
  policy: ItemFailurePolicy,
}

pub struct ImageClassifierContext {
  model: ImageClassifier,
  device: Device,
  output_dir: Option<PathBuf>,
  input_root: Option<PathBuf>,
}

impl ImageClassifierContext {
  pub fn model(&self) -> &ImageClassifier {
    &self.model
  }

  pub fn device(&self) -> Device {
    self.device
  }
}

impl ImageClassifierScorer {
  pub fn new(mode: OutputMode, policy: ItemFailurePolicy) -> Self {
    Self { mode, policy }
  }

  fn classify(&self, context: &ImageClassifierContext, item: &Path) -> Result<ResultRecord, ScoreError> {
    let model = &context.model;
    let tensor = read_image_tensor(item, model.input_size(), model.mean(), model.std())?;
    let Classification { class, probability } = model.infer(&tensor)?;

    let prediction = match model.label(class) {
      Some(label) => Prediction::Label {
        class,
        label: label.to_string(),
        probability,
      },
      None => Prediction::Class { class, probability },
    };
    Ok(ResultRecord::new(item, prediction))
  }
}

impl ScoringCallback for ImageClassifierScorer {
  type Context = ImageClassifierContext;
  type Error = ScoreError;

  fn output_mode(&self) -> OutputMode {
    self.mode
  }

  fn init(&self, env: &WorkerEnv) -> Result<Self::Context, Self::Error> {
    let device: Device = env.device.parse()?;
    info!("选择计算设备: {:?}", device);

    let model = match ModelManifest::load(&env.model_dir)? {
      ModelManifest::ImageClassifier(spec) => ImageClassifier::from_spec(spec)?,
      other => {
        return Err(
          ModelError::KindMismatch {
            expected: "image-classifier",
            found: other.kind(),
          }
          .into(),
        );
      }
    };
    info!("模型加载完成, 类别数 {}", model.num_classes());

    let output_dir = prepare_output_dir(self.mode, env)?;
    Ok(ImageClassifierContext {
      model,
      device,
      output_dir,
      input_root: env.input_root.clone(),
    })
  }

  fn run(&self, context: &Self::Context, batch: &MiniBatch) -> Result<BatchOutput, Self::Error> {
    debug!("小批次 {}: {} 张图像", batch.id(), batch.len());
    match self.mode {
      OutputMode::Records => {
        let (records, skipped) =
          score_items(batch, self.policy, |item| self.classify(context, item))?;
        Ok(BatchOutput::records(records, skipped))
      }
      OutputMode::WriteOwn => {
        let dir = context
          .output_dir
          .as_deref()
          .ok_or(ScoreError::MissingOutputDir)?;
        let (items, skipped) = score_items(batch, self.policy, |item| {
          let record = self.classify(context, item)?;
          write_item_record(dir, context.input_root.as_deref(), item, &record)?;
          Ok::<_, ScoreError>(item.to_path_buf())
        })?;
        Ok(BatchOutput::acknowledged(items, skipped))
      }
    }
  }

  fn schema(&self, context: &Self::Context) -> RecordSchema {
    match self.mode {
      OutputMode::WriteOwn => RecordSchema::acknowledgment(),
      OutputMode::Records if context.model.has_labels() => RecordSchema::labeled(),
      OutputMode::Records => RecordSchema::classification(),
    }
  }
}
