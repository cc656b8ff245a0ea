//! StoreConfig - BackupStore の設定
//!
//! 構築時（`BackupStoreBuilder::build`）に一度だけ検証する。
//! 不正な設定で操作を試みることはない。

use crate::error::RotorError;

pub const DEFAULT_ROTATION_KEY: &str = "backup_rotation_index.yml";

/// 5 GiB
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// 4 GiB
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024 * 1024;

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 1;

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// bucket / container 名。認証情報から導出せず、明示的に渡す。
    pub bucket: String,

    /// rotation document を置く key
    pub rotation_key: String,

    /// 単一オブジェクトとして置ける最大サイズ
    pub max_object_size: u64,

    /// 分割時の各 chunk の最大サイズ（`<= max_object_size`）
    pub chunk_size: u64,

    /// 1 artifact あたり同時にアップロードする chunk 数
    pub upload_concurrency: usize,

    /// rotation document の条件付き書き込みが競合したときの再試行回数
    pub max_conflict_retries: u32,
}

impl StoreConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            rotation_key: DEFAULT_ROTATION_KEY.to_string(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_rotation_key(mut self, key: impl Into<String>) -> Self {
        self.rotation_key = key.into();
        self
    }

    pub fn with_sizes(mut self, max_object_size: u64, chunk_size: u64) -> Self {
        self.max_object_size = max_object_size;
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn validate(&self) -> Result<(), RotorError> {
        let invalid = |msg: String| Err(RotorError::ConfigInvalid(msg));
        if self.bucket.trim().is_empty() {
            return invalid("bucket must not be empty".to_string());
        }
        if self.rotation_key.is_empty() {
            return invalid("rotation_key must not be empty".to_string());
        }
        if self.chunk_size == 0 {
            return invalid("chunk_size must be > 0".to_string());
        }
        if self.chunk_size > self.max_object_size {
            return invalid(format!(
                "chunk_size ({}) exceeds max_object_size ({})",
                self.chunk_size, self.max_object_size
            ));
        }
        if self.upload_concurrency == 0 {
            return invalid("upload_concurrency must be >= 1".to_string());
        }
        Ok(())
    }
}
