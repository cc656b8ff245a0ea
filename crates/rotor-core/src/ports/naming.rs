//! ArtifactNamer port - identifier 生成の抽象化
//!
//! ソース artifact（ファイルパス）から時系列ソート可能な identifier を作ります。
//!
//! # 実装
//! - **TimestampNamer**: `YYYYMMDDTHHMMSS.mmmZ-<basename>`（本番用）

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::domain::ArtifactId;
use crate::ports::Clock;

/// identifier を生成する外部コラボレータ
///
/// # 保証
/// - 呼び出し順 = identifier の辞書順（単調増加）
/// - object key のプレフィックスとしてそのまま使える文字だけを含む
pub trait ArtifactNamer: Send + Sync {
    fn timestamped_prefix(&self, source: &Path) -> ArtifactId;
}

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Clock ベースの Namer
///
/// 同じミリ秒内（あるいは時計が戻った場合）は直前の値 + 1ms を使うので、
/// 生成される identifier は常に狭義単調増加になる。
pub struct TimestampNamer<C> {
    clock: C,
    last_millis: Mutex<Option<i64>>,
}

impl<C: Clock> TimestampNamer<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last_millis: Mutex::new(None),
        }
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut last = self.last_millis.lock().unwrap_or_else(|e| e.into_inner());
        let millis = match *last {
            Some(prev) if now.timestamp_millis() <= prev => prev + 1,
            _ => now.timestamp_millis(),
        };
        *last = Some(millis);
        DateTime::from_timestamp_millis(millis).unwrap_or(now)
    }
}

impl<C: Clock> ArtifactNamer for TimestampNamer<C> {
    fn timestamped_prefix(&self, source: &Path) -> ArtifactId {
        let stamp = self.next_timestamp().format(TIMESTAMP_FORMAT);
        ArtifactId::new(format!("{stamp}-{}", key_safe_basename(source)))
    }
}

fn key_safe_basename(source: &Path) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() {
        return "artifact".to_string();
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
