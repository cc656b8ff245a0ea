//! InMemoryObjectStore - 開発・テスト用のオブジェクトストア
//!
//! - BTreeMap で key を辞書順に保持（prefix listing がそのままソート済み）
//! - 全操作を記録（テストでの検証用）
//! - key プレフィックス単位で失敗を注入できる
//! - version token は単調増加のカウンタ（削除→再作成でも再利用しない）
//! - `put` は本体をバッファに読み切ってから保存する（テスト用なのでストリーミングしない）

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::ports::{ObjectBody, ObjectStore, StoredObject, WriteOutcome, WritePrecondition};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put {
        key: String,
        size: usize,
        precondition: WritePrecondition,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
    List {
        prefix: String,
    },
}

/// Which operation an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Put,
    Get,
    Delete,
    List,
    Any,
}

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    version: u64,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Entry>,
    next_version: u64,
    operations: Vec<StoreOp>,
    failures: Vec<(FailOn, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    state: Arc<Mutex<State>>,
    latency: Option<Duration>,
    in_flight_puts: Arc<AtomicUsize>,
    peak_in_flight_puts: Arc<AtomicUsize>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 各操作の前に `latency` だけ待つ（並行アップロードのテスト用）
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn operations(&self) -> Vec<StoreOp> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// `key_prefix` で始まる key への `on` 操作を失敗させる
    pub fn inject_failure(&self, on: FailOn, key_prefix: impl Into<String>) {
        self.lock().failures.push((on, key_prefix.into()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).map(|e| e.data.clone())
    }

    /// Highest number of `put` calls that were in progress at the same time.
    pub fn peak_concurrent_puts(&self) -> usize {
        self.peak_in_flight_puts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_failure(state: &State, op: FailOn, key: &str) -> Result<(), StoreError> {
        let injected = state
            .failures
            .iter()
            .any(|(on, prefix)| (*on == op || *on == FailOn::Any) && key.starts_with(prefix.as_str()));
        if injected {
            return Err(StoreError::Unavailable(format!(
                "injected {op:?} failure for key {key}"
            )));
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        body: ObjectBody<'_>,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome, StoreError> {
        let data = body.into_bytes().await?;
        let now = self.in_flight_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight_puts.fetch_max(now, Ordering::SeqCst);
        self.maybe_delay().await;
        self.in_flight_puts.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        state.operations.push(StoreOp::Put {
            key: key.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        Self::check_failure(&state, FailOn::Put, key)?;

        let current = state.objects.get(key).map(|e| e.version.to_string());
        let satisfied = match &precondition {
            WritePrecondition::None => true,
            WritePrecondition::DoesNotExist => current.is_none(),
            WritePrecondition::MatchesVersion(expected) => current.as_ref() == Some(expected),
        };
        if !satisfied {
            return Ok(WriteOutcome::PreconditionFailed {
                current_version: current,
            });
        }

        state.next_version += 1;
        let version = state.next_version;
        state.objects.insert(key.to_string(), Entry { data, version });
        Ok(WriteOutcome::Written {
            version: version.to_string(),
        })
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.maybe_delay().await;
        let mut state = self.lock();
        state.operations.push(StoreOp::Get {
            key: key.to_string(),
        });
        Self::check_failure(&state, FailOn::Get, key)?;
        state
            .objects
            .get(key)
            .map(|e| StoredObject {
                data: e.data.clone(),
                version: e.version.to_string(),
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.maybe_delay().await;
        let mut state = self.lock();
        state.operations.push(StoreOp::Delete {
            key: key.to_string(),
        });
        Self::check_failure(&state, FailOn::Delete, key)?;
        state.objects.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.maybe_delay().await;
        let mut state = self.lock();
        state.operations.push(StoreOp::List {
            prefix: prefix.to_string(),
        });
        Self::check_failure(&state, FailOn::List, prefix)?;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
