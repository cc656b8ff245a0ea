//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryObjectStore**: 開発・テスト用（操作記録・失敗注入つき）
//! - **LocalDirObjectStore**: ローカルディレクトリを bucket として使う
//! - **YamlCodec / JsonCodec**: rotation document の形式
//!
//! S3 などリモートのオブジェクトストアは ObjectStore を実装した別クレートで提供する想定。

pub mod codec;
pub mod local_dir;
pub mod memory_store;

// 主要な型を再エクスポート
pub use self::codec::{JsonCodec, YamlCodec};
pub use self::local_dir::LocalDirObjectStore;
pub use self::memory_store::{FailOn, InMemoryObjectStore, StoreOp};
