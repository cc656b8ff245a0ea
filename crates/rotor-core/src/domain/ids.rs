//! Artifact identifiers.
//!
//! `ArtifactId` は ArtifactNamer が生成する不透明な文字列キーです。
//!
//! ## 性質
//! - **時刻でソート可能**: 辞書順がアップロード順と一致する（Namer 側の保証）
//! - **単一オブジェクト**: そのまま object key として使う
//! - **chunk 分割時**: 各 chunk key の共通プレフィックスになる（`<id>.00`, `<id>.01`, ...）
//!
//! 呼び出し側には chunk suffix は見えません。常に `ArtifactId` だけを扱います。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between an identifier and its chunk index.
pub const CHUNK_SEPARATOR: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// index 番目の chunk の object key
    ///
    /// `width` 桁でゼロ埋めするので、同じ artifact の chunk は辞書順 = アップロード順になる。
    pub fn chunk_key(&self, index: usize, width: usize) -> String {
        format!("{}{}{:0width$}", self.0, CHUNK_SEPARATOR, index, width = width)
    }

    /// `key` がこの artifact の object か（素のキー、または `.` + 数字の chunk key）
    ///
    /// 同じプレフィックスを持つだけの別 artifact（例: `<id>x`）は含まない。
    pub fn owns_key(&self, key: &str) -> bool {
        match key.strip_prefix(self.0.as_str()) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix(CHUNK_SEPARATOR)
                .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())),
            None => false,
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ArtifactId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ArtifactId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for ArtifactId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
