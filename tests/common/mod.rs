// 该文件是 Piliang （批量推理） 项目的一部分。
// tests/common/mod.rs - 集成测试的公共夹具
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

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use piliang::{host::HostConfig, model::MODEL_FILE_NAME, scorer::WorkerEnv};

pub const RED: [u8; 3] = [255, 0, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];
pub const WHITE: [u8; 3] = [255, 255, 255];

/// 2x2 的纯色图像
#[cfg(feature = "read_image_file")]
pub fn write_png(path: &Path, color: [u8; 3]) -> PathBuf {
  let image = image::RgbImage::from_pixel(2, 2, image::Rgb(color));
  image.save(path).unwrap();
  path.to_path_buf()
}

/// 两个类别：红色通道之和与蓝色通道之和
pub fn write_color_model(dir: &Path, with_labels: bool) -> PathBuf {
  let red: Vec<f32> = (0..12).map(|i| if i < 4 { 1.0 } else { 0.0 }).collect();
  let blue: Vec<f32> = (0..12).map(|i| if i >= 8 { 1.0 } else { 0.0 }).collect();
  let labels: Vec<&str> = if with_labels {
    vec!["red", "blue"]
  } else {
    Vec::new()
  };
  let manifest = serde_json::json!({
    "kind": "image-classifier",
    "width": 2,
    "height": 2,
    "weights": [red, blue],
    "bias": [0.0, 0.0],
    "labels": labels,
  });
  write_manifest(dir, &manifest)
}

/// 权重大到任何亮色输入都会让第一个类别的输出溢出
pub fn write_overflowing_model(dir: &Path) -> PathBuf {
  let manifest = serde_json::json!({
    "kind": "image-classifier",
    "width": 2,
    "height": 2,
    "weights": [vec![3.0e38_f32; 12], vec![0.0_f32; 12]],
    "bias": [0.0, 0.0],
  });
  write_manifest(dir, &manifest)
}

/// `prediction = 2 * a + b + 1`
pub fn write_tabular_model(dir: &Path) -> PathBuf {
  let manifest = serde_json::json!({
    "kind": "tabular-regressor",
    "features": ["a", "b"],
    "weights": [[2.0, 1.0]],
    "bias": [1.0],
  });
  write_manifest(dir, &manifest)
}

fn write_manifest(dir: &Path, manifest: &serde_json::Value) -> PathBuf {
  std::fs::create_dir_all(dir).unwrap();
  std::fs::write(
    dir.join(MODEL_FILE_NAME),
    serde_json::to_vec_pretty(manifest).unwrap(),
  )
  .unwrap();
  dir.to_path_buf()
}

pub fn write_csv(path: &Path, text: &str) -> PathBuf {
  std::fs::write(path, text).unwrap();
  path.to_path_buf()
}

pub fn host_config(model_dir: &Path, output_dir: &Path) -> HostConfig {
  let mut config = HostConfig::new(WorkerEnv::new(model_dir), output_dir);
  config.timeout = Duration::from_secs(5);
  config
}

pub fn read_rows(path: &Path) -> Vec<String> {
  std::fs::read_to_string(path)
    .unwrap()
    .lines()
    .map(str::to_string)
    .collect()
}
