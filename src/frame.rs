// 该文件是 Piliang （批量推理） 项目的一部分。
// src/frame.rs - NCHW 张量定义
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

pub const RGB_CHANNELS: usize = 3;

/// 按 NCHW 排列的单张 RGB 图像，已归一化为 f32
#[derive(Debug, Clone, PartialEq)]
pub struct NchwTensor {
  height: usize,
  width: usize,
  data: Box<[f32]>,
}

impl NchwTensor {
  pub fn with_shape(height: usize, width: usize) -> Self {
    let data = vec![0f32; RGB_CHANNELS * height * width].into_boxed_slice();
    Self {
      height,
      width,
      data,
    }
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn index(&self, c: usize, h: usize, w: usize) -> usize {
    c * self.height * self.width + h * self.width + w
  }
}

impl AsRef<[f32]> for NchwTensor {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}

impl AsMut<[f32]> for NchwTensor {
  fn as_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn planes_are_contiguous() {
    let tensor = NchwTensor::with_shape(2, 3);
    assert_eq!(tensor.len(), 18);
    assert_eq!(tensor.index(0, 0, 0), 0);
    assert_eq!(tensor.index(0, 1, 2), 5);
    assert_eq!(tensor.index(1, 0, 0), 6);
    assert_eq!(tensor.index(2, 1, 2), 17);
  }
}
