//! rotor-core
//!
//! Core building blocks for rotating backup artifacts in an object store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ArtifactId, RotationIndex, RetentionPolicy, ChunkPlan）
//! - **ports**: 抽象化レイヤー（ObjectStore, ArtifactNamer, Clock, RotationCodec）
//! - **app**: アプリケーションロジック（BackupStore, BackupStoreBuilder, StoreConfig）
//! - **impls**: ports の実装（InMemoryObjectStore, LocalDirObjectStore, YamlCodec など）
//! - **error**: エラー型

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{BackupStore, BackupStoreBuilder, CleanupReport, StoreConfig};
pub use domain::{ArtifactId, RetentionPolicy, RotationIndex};
pub use error::{RotorError, StoreError};
