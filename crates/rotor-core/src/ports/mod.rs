//! Ports - 抽象化レイヤー
//!
//! このモジュールは外部コラボレータへのインターフェースを定義します。
//! 各 trait の実装は `impls` にあり、BackupStore は trait object 経由でだけ使います。
//!
//! - ObjectStore: バックアップ先（key → bytes、prefix listing、条件付き書き込み）
//! - ArtifactNamer: 時系列ソート可能な identifier の生成
//! - Clock: 時刻
//! - RotationCodec: rotation document の形式

pub mod clock;
pub mod codec;
pub mod naming;
pub mod object_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::codec::RotationCodec;
pub use self::naming::{ArtifactNamer, TimestampNamer};
pub use self::object_store::{
    ObjectBody, ObjectStore, SourceFault, StoredObject, WriteOutcome, WritePrecondition,
};
