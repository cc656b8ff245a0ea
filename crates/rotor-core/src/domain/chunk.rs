//! ChunkPlan - 巨大 artifact の分割計画
//!
//! object store の単一オブジェクト上限（`max_object_size`）を超える artifact は
//! `chunk_size` ごとに分割してアップロードします。
//!
//! # chunk key の規約
//! - `<identifier>.<index>`（index は 0 始まり）
//! - index は `max(2, 桁数(count - 1))` 桁でゼロ埋め
//! - 固定幅なので、prefix listing の辞書順ソートがそのままアップロード順になる

use super::ids::ArtifactId;
use crate::error::RotorError;

/// Minimum width of the numeric chunk suffix (`.00`, `.01`, ...).
pub const CHUNK_SUFFIX_MIN_WIDTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPlan {
    /// `size <= max_object_size`: identifier そのものに 1 オブジェクト
    Single { size: u64 },
    /// `size > max_object_size`: `count` 個の chunk に分割
    Chunked {
        size: u64,
        chunk_size: u64,
        count: usize,
        width: usize,
    },
}

impl ChunkPlan {
    /// Plan the upload of `size` bytes.
    ///
    /// `chunk_size` must be non-zero and `<= max_object_size`; the builder
    /// rejects any other configuration before a plan is ever made.
    pub fn new(size: u64, max_object_size: u64, chunk_size: u64) -> Result<Self, RotorError> {
        if size <= max_object_size {
            return Ok(ChunkPlan::Single { size });
        }
        let count = usize::try_from(size.div_ceil(chunk_size)).map_err(|_| {
            RotorError::ConfigInvalid(format!(
                "{size} bytes in chunks of {chunk_size} needs more chunks than this platform can count"
            ))
        })?;
        Ok(ChunkPlan::Chunked {
            size,
            chunk_size,
            count,
            width: suffix_width(count),
        })
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, ChunkPlan::Chunked { .. })
    }

    /// Number of objects the upload produces.
    pub fn object_count(&self) -> usize {
        match *self {
            ChunkPlan::Single { .. } => 1,
            ChunkPlan::Chunked { count, .. } => count,
        }
    }

    /// Byte offset in the source where the `index`-th object starts.
    pub fn object_offset(&self, index: usize) -> Option<u64> {
        match *self {
            ChunkPlan::Single { .. } => (index == 0).then_some(0),
            ChunkPlan::Chunked {
                chunk_size, count, ..
            } => (index < count).then(|| index as u64 * chunk_size),
        }
    }

    /// Byte length of the `index`-th object, or `None` past the end.
    pub fn object_len(&self, index: usize) -> Option<u64> {
        match *self {
            ChunkPlan::Single { size } => (index == 0).then_some(size),
            ChunkPlan::Chunked {
                size,
                chunk_size,
                count,
                ..
            } => {
                if index >= count {
                    return None;
                }
                let start = index as u64 * chunk_size;
                Some((size - start).min(chunk_size))
            }
        }
    }

    pub fn object_key(&self, id: &ArtifactId, index: usize) -> String {
        match *self {
            ChunkPlan::Single { .. } => id.as_str().to_string(),
            ChunkPlan::Chunked { width, .. } => id.chunk_key(index, width),
        }
    }

    pub fn object_keys(&self, id: &ArtifactId) -> Vec<String> {
        (0..self.object_count())
            .map(|index| self.object_key(id, index))
            .collect()
    }
}

fn suffix_width(count: usize) -> usize {
    let last_index = count.saturating_sub(1);
    last_index.to_string().len().max(CHUNK_SUFFIX_MIN_WIDTH)
}
