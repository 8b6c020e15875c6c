// 该文件是 Piliang （批量推理） 项目的一部分。
// src/input.rs - 输入条目发现与读取
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

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, url_path};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::read_image_tensor;

mod read_table_file;
pub use self::read_table_file::Table;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("URI scheme mismatch: expected '{expected}', found '{found}'")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("I/O error {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[cfg(feature = "read_image_file")]
  #[error("Image loading error {path}: {source}")]
  Image {
    path: PathBuf,
    source: image::ImageError,
  },
  #[error("Table error {path} (line {line}): {reason}")]
  Table {
    path: PathBuf,
    line: usize,
    reason: String,
  },
  #[error("Column '{column}' not found in {path}")]
  MissingColumn { path: PathBuf, column: String },
}

/// 目录下的全部文件，可用 `ext` 查询参数过滤扩展名，例如
/// `folder:///data/images?ext=png&ext=jpg`
#[derive(Debug, Clone)]
pub struct FolderInput {
  items: Vec<PathBuf>,
}

impl FromUrlWithScheme for FolderInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for FolderInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let extensions: Vec<String> = url
      .query_pairs()
      .filter(|(k, _)| k == "ext")
      .map(|(_, v)| v.trim_start_matches('.').to_ascii_lowercase())
      .collect();

    let directory = url_path(url);
    let io_err = |source| InputError::Io {
      path: directory.clone(),
      source,
    };

    let mut items = Vec::new();
    for entry in std::fs::read_dir(&directory).map_err(io_err)? {
      let path = entry.map_err(io_err)?.path();
      if !path.is_file() {
        continue;
      }
      let accepted = extensions.is_empty()
        || path
          .extension()
          .and_then(|e| e.to_str())
          .is_some_and(|e| extensions.contains(&e.to_ascii_lowercase()));
      if accepted {
        items.push(path);
      }
    }
    // 目录遍历顺序不稳定，排序后切分结果才可复现
    items.sort();

    debug!("目录 {} 中找到 {} 个输入", directory.display(), items.len());
    Ok(FolderInput { items })
  }
}

/// 单个输入文件
#[derive(Debug, Clone)]
pub struct FileInput {
  path: PathBuf,
}

impl FromUrlWithScheme for FileInput {
  const SCHEME: &'static str = "file";
}

impl FromUrl for FileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let path = url_path(url);
    if !path.is_file() {
      return Err(InputError::Io {
        path,
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
      });
    }
    Ok(FileInput { path })
  }
}

pub enum InputWrapper {
  Folder(FolderInput),
  File(FileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      FolderInput::SCHEME => Ok(InputWrapper::Folder(FolderInput::from_url(url)?)),
      FileInput::SCHEME => Ok(InputWrapper::File(FileInput::from_url(url)?)),
      other => Err(InputError::SchemeMismatch {
        expected: FolderInput::SCHEME,
        found: other.to_string(),
      }),
    }
  }
}

impl InputWrapper {
  pub fn into_items(self) -> Vec<PathBuf> {
    match self {
      InputWrapper::Folder(folder) => folder.items,
      InputWrapper::File(file) => vec![file.path],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn folder_url(dir: &std::path::Path, query: &str) -> Url {
    let mut url = Url::parse("folder:///").unwrap();
    url.set_path(&dir.to_string_lossy());
    if !query.is_empty() {
      url.set_query(Some(query));
    }
    url
  }

  #[test]
  fn folder_lists_sorted_files_with_filter() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["b.png", "a.PNG", "c.txt"] {
      std::fs::write(dir.path().join(name), b"x").unwrap();
    }
    std::fs::create_dir(dir.path().join("nested.png")).unwrap();

    let items = InputWrapper::from_url(&folder_url(dir.path(), "ext=png"))
      .unwrap()
      .into_items();
    let names: Vec<_> = items
      .iter()
      .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
      .collect();
    assert_eq!(names, vec!["a.PNG", "b.png"]);

    let all = InputWrapper::from_url(&folder_url(dir.path(), ""))
      .unwrap()
      .into_items();
    assert_eq!(all.len(), 3);
  }

  #[test]
  fn file_input_requires_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x.csv");
    let url = Url::from_file_path(&path).unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::Io { .. })
    ));

    std::fs::write(&path, "a\n1\n").unwrap();
    assert_eq!(InputWrapper::from_url(&url).unwrap().into_items(), vec![path]);
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch { .. })
    ));
  }
}
