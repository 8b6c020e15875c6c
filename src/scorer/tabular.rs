// 该文件是 Piliang （批量推理） 项目的一部分。
// src/scorer/tabular.rs - 表格评分
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

use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::{
  config::ItemFailurePolicy,
  input::Table,
  model::{Device, Model, ModelError, ModelManifest, TabularModel, TabularTask},
  output::write_columnar_snapshot,
  record::{BatchOutput, MiniBatch, RecordSchema},
  scorer::{OutputMode, ScoreError, ScoringCallback, WorkerEnv, prepare_output_dir, score_items},
};

/// 每个输入表格写出一份带 `prediction` 列的列存快照，只支持写出模式
#[derive(Debug, Clone)]
pub struct TabularScorer {
  mode: OutputMode,
  policy: ItemFailurePolicy,
}

pub struct TabularContext {
  model: TabularModel,
  device: Device,
  output_dir: PathBuf,
  input_root: Option<PathBuf>,
}

impl TabularContext {
  pub fn model(&self) -> &TabularModel {
    &self.model
  }

  pub fn device(&self) -> Device {
    self.device
  }
}

impl TabularScorer {
  pub fn new(mode: OutputMode, policy: ItemFailurePolicy) -> Self {
    Self { mode, policy }
  }
}

impl ScoringCallback for TabularScorer {
  type Context = TabularContext;
  type Error = ScoreError;

  fn output_mode(&self) -> OutputMode {
    self.mode
  }

  fn init(&self, env: &WorkerEnv) -> Result<Self::Context, Self::Error> {
    if self.mode != OutputMode::WriteOwn {
      error!("表格评分只支持写出模式");
      return Err(ScoreError::UnsupportedOutputMode {
        scorer: "tabular",
        mode: self.mode,
      });
    }

    let device: Device = env.device.parse()?;
    info!("选择计算设备: {:?}", device);

    let model = match ModelManifest::load(&env.model_dir)? {
      ModelManifest::TabularRegressor(spec) => TabularModel::from_spec(spec, TabularTask::Regression)?,
      ModelManifest::TabularClassifier(spec) => {
        TabularModel::from_spec(spec, TabularTask::Classification)?
      }
      other => {
        return Err(
          ModelError::KindMismatch {
            expected: "tabular-regressor",
            found: other.kind(),
          }
          .into(),
        );
      }
    };
    info!(
      "模型加载完成: {:?}, 特征 {:?}",
      model.task(),
      model.features()
    );

    let output_dir = prepare_output_dir(self.mode, env)?.ok_or(ScoreError::MissingOutputDir)?;
    Ok(TabularContext {
      model,
      device,
      output_dir,
      input_root: env.input_root.clone(),
    })
  }

  fn run(&self, context: &Self::Context, batch: &MiniBatch) -> Result<BatchOutput, Self::Error> {
    debug!("小批次 {}: {} 个表格", batch.id(), batch.len());
    let (items, skipped) = score_items(batch, self.policy, |item| {
      let table = Table::read(item)?;
      let rows = table.select(context.model.features())?;
      let predictions = rows
        .iter()
        .map(|row| context.model.infer(row))
        .collect::<Result<Vec<_>, _>>()?;
      write_columnar_snapshot(
        &context.output_dir,
        context.input_root.as_deref(),
        item,
        &table,
        &predictions,
      )?;
      Ok::<_, ScoreError>(item.to_path_buf())
    })?;
    Ok(BatchOutput::acknowledged(items, skipped))
  }

  fn schema(&self, _context: &Self::Context) -> RecordSchema {
    RecordSchema::acknowledgment()
  }
}
