//! RetentionPolicy - generation ごとの保持数
//!
//! policy は index には保存しない。cleanup の呼び出し時に渡す。

use std::fmt;
use std::str::FromStr;

use crate::error::RotorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub generation: String,
    pub keep: usize,
}

impl RetentionPolicy {
    pub fn new(generation: impl Into<String>, keep: usize) -> Self {
        Self {
            generation: generation.into(),
            keep,
        }
    }

    /// 外部入力（符号付き）から作成。負の keep は丸めずに拒否する。
    pub fn try_new(generation: impl Into<String>, keep: i64) -> Result<Self, RotorError> {
        let generation = generation.into();
        if generation.is_empty() {
            return Err(RotorError::ConfigInvalid(
                "retention policy needs a generation name".to_string(),
            ));
        }
        let keep = usize::try_from(keep).map_err(|_| {
            RotorError::ConfigInvalid(format!(
                "keep count for generation {generation} must be >= 0, got {keep}"
            ))
        })?;
        Ok(Self { generation, keep })
    }
}

/// `"daily=7"` 形式
impl FromStr for RetentionPolicy {
    type Err = RotorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, keep) = s.split_once('=').ok_or_else(|| {
            RotorError::ConfigInvalid(format!("expected <generation>=<keep>, got {s:?}"))
        })?;
        let keep: i64 = keep.trim().parse().map_err(|_| {
            RotorError::ConfigInvalid(format!("keep count in {s:?} is not an integer"))
        })?;
        Self::try_new(generation.trim(), keep)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.generation, self.keep)
    }
}
