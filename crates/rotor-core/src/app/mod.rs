//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてバックアップのローテーションを実装します。
//!
//! # 主要コンポーネント
//! - **StoreConfig**: サイズ上限・rotation key などの設定
//! - **BackupStoreBuilder**: 構築とワイヤリング（起動時検証）
//! - **BackupStore**: upload / delete / verify_hierarchy / record / cleanup

pub mod backup_store;
pub mod builder;
pub mod config;

// 主要な型を再エクスポート
pub use self::backup_store::{BackupStore, CleanupReport};
pub use self::builder::BackupStoreBuilder;
pub use self::config::StoreConfig;
