//! Error types.
//!
//! - `StoreError`: ObjectStore ポートが返すエラー（NotFound とそれ以外）
//! - `CodecError`: RotationCodec の encode/decode エラー
//! - `RotorError`: BackupStore の各操作が呼び出し元に返すエラー
//!
//! `RotorError` の各 variant は操作名と対象の key / generation を保持する。
//! index が存在しない（NotFound）ケースはエラーではなく空の index として扱う。

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::ArtifactId;

/// ObjectStore の呼び出しで発生するエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// RotationCodec のエラー
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RotorError {
    /// 既存の rotation document が読めない。空の index で上書きしてはいけない。
    #[error("rotation index at key={key} is corrupt during {op}: {source}")]
    IndexCorrupt {
        op: &'static str,
        key: String,
        #[source]
        source: CodecError,
    },

    /// メモリ上の index を document に変換できない（store には何も書いていない）
    #[error("cannot encode rotation index for key={key} during {op}: {source}")]
    IndexEncode {
        op: &'static str,
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// 一部の chunk だけ保存された状態。ロールバックはしない。
    #[error(
        "upload of {identifier} failed at chunk {failed_chunk}; stored chunks: {uploaded:?}"
    )]
    UploadPartialFailure {
        identifier: ArtifactId,
        uploaded: Vec<usize>,
        failed_chunk: usize,
        #[source]
        source: StoreError,
    },

    #[error("delete of {identifier} failed for keys {failed_keys:?}")]
    DeleteFailure {
        identifier: ArtifactId,
        failed_keys: Vec<String>,
        #[source]
        source: StoreError,
    },

    #[error("object store unavailable during {op} (key={key})")]
    StoreUnavailable {
        op: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("rotation index at key={key} kept changing; gave up after {attempts} attempts")]
    ConcurrentModification { key: String, attempts: u32 },

    #[error("generation not present in rotation index during {op}: {generation}")]
    UnknownGeneration { op: &'static str, generation: String },

    #[error("cannot read source artifact {path}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RotorError {
    pub(crate) fn store(op: &'static str, key: impl Into<String>, source: StoreError) -> Self {
        RotorError::StoreUnavailable {
            op,
            key: key.into(),
            source,
        }
    }
}
