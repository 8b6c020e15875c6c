// 该文件是 Piliang （批量推理） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::Path;

use image::{ImageReader, RgbImage, imageops::FilterType};
use tracing::debug;

use crate::{frame::NchwTensor, input::InputError};

/// 读取图像，缩放到 `width`x`height`，按通道做 `(x / 255 - mean) / std` 归一化
pub fn read_image_tensor(
  path: &Path,
  (width, height): (u32, u32),
  mean: [f32; 3],
  std: [f32; 3],
) -> Result<NchwTensor, InputError> {
  let image_err = |source| InputError::Image {
    path: path.to_path_buf(),
    source,
  };

  let reader = ImageReader::open(path).map_err(|source| InputError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  let image = reader
    .with_guessed_format()
    .map_err(|source| InputError::Io {
      path: path.to_path_buf(),
      source,
    })?
    .decode()
    .map_err(image_err)?;

  debug!(
    "读取图像 {}: {}x{}",
    path.display(),
    image.width(),
    image.height()
  );

  let image = if image.width() != width || image.height() != height {
    image.resize_exact(width, height, FilterType::Triangle)
  } else {
    image
  };

  Ok(to_nchw(&image.to_rgb8(), mean, std))
}

fn to_nchw(image: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> NchwTensor {
  let (width, height) = image.dimensions();
  let mut frame = NchwTensor::with_shape(height as usize, width as usize);

  let channels = frame.channels();
  for c in 0..channels {
    for h in 0..height {
      for w in 0..width {
        let value = image.get_pixel(w, h)[c] as f32 / 255.0;
        let index = frame.index(c, h as usize, w as usize);
        frame.as_mut()[index] = (value - mean[c]) / std[c];
      }
    }
  }
  frame
}
