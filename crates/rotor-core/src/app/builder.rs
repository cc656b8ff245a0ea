//! BackupStoreBuilder - BackupStore の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に StoreConfig を検証（chunk_size > max_object_size などは ConfigInvalid）
//! - ObjectStore が未設定なら ConfigInvalid
//! - Namer / Codec は省略可能（TimestampNamer<SystemClock> / YamlCodec）

use std::sync::Arc;

use crate::app::{BackupStore, StoreConfig};
use crate::error::RotorError;
use crate::impls::YamlCodec;
use crate::ports::{ArtifactNamer, ObjectStore, RotationCodec, SystemClock, TimestampNamer};

/// # 使用例
/// ```ignore
/// let store = BackupStoreBuilder::new(StoreConfig::new("backups"))
///     .store(LocalDirObjectStore::open_or_create("/srv/backup", "backups")?)
///     .build()?;
/// ```
pub struct BackupStoreBuilder {
    config: StoreConfig,
    store: Option<Arc<dyn ObjectStore>>,
    namer: Option<Arc<dyn ArtifactNamer>>,
    codec: Option<Arc<dyn RotationCodec>>,
}

impl BackupStoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            store: None,
            namer: None,
            codec: None,
        }
    }

    pub fn store(self, store: impl ObjectStore + 'static) -> Self {
        self.shared_store(Arc::new(store))
    }

    /// 複数の BackupStore で同じ ObjectStore を共有する場合
    pub fn shared_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn namer(mut self, namer: impl ArtifactNamer + 'static) -> Self {
        self.namer = Some(Arc::new(namer));
        self
    }

    pub fn codec(self, codec: impl RotationCodec + 'static) -> Self {
        self.shared_codec(Arc::new(codec))
    }

    /// 形式を実行時に選ぶ場合（CLI の `--index-format` など）
    pub fn shared_codec(mut self, codec: Arc<dyn RotationCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> Result<BackupStore, RotorError> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| RotorError::ConfigInvalid("no object store configured".to_string()))?;
        let namer = self
            .namer
            .unwrap_or_else(|| Arc::new(TimestampNamer::new(SystemClock)));
        let codec = self.codec.unwrap_or_else(|| Arc::new(YamlCodec));
        Ok(BackupStore::from_parts(self.config, store, namer, codec))
    }
}
