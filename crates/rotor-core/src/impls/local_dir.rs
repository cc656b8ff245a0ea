//! LocalDirObjectStore - ローカルディレクトリを bucket として使うオブジェクトストア
//!
//! # レイアウト
//! - `<root>/<bucket>/<key>`（key 内の `/` はサブディレクトリ）
//! - 書き込みは同じディレクトリの一時ファイルへストリーミング → rename
//!   （読み手が書きかけを見ることはない。失敗時は一時ファイルを残さない）
//! - version token は内容の SHA-256（書き込みながら計算する）
//! - rename と version 確認は bucket 単位のロックファイル（fs2）の排他ロック下で行う
//!
//! 同期 I/O は `spawn_blocking` で実行します。

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::StoreError;
use crate::ports::{ObjectBody, ObjectStore, StoredObject, WriteOutcome, WritePrecondition};

const INTERNAL_PREFIX: &str = ".rotor";
const LOCK_FILE: &str = ".rotor.lock";
const STAGING_PREFIX: &str = ".rotor-tmp-";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LocalDirObjectStore {
    bucket_dir: Arc<PathBuf>,
}

impl LocalDirObjectStore {
    /// `<root>/<bucket>` を開く。なければ作成する（find-or-create）。
    pub fn open_or_create(root: impl AsRef<Path>, bucket: &str) -> Result<Self, StoreError> {
        if bucket.is_empty()
            || bucket.contains(['/', '\\'])
            || bucket == "."
            || bucket == ".."
        {
            return Err(StoreError::InvalidKey(bucket.to_string()));
        }
        let bucket_dir = root.as_ref().join(bucket);
        fs::create_dir_all(&bucket_dir)?;
        tracing::debug!(path = %bucket_dir.display(), "opened local bucket");
        Ok(Self {
            bucket_dir: Arc::new(bucket_dir),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let dir = Arc::clone(&self.bucket_dir);
        tokio::task::spawn_blocking(move || f(&dir))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }

    /// 本体を一時ファイルへ流し込み、内容の version を返す
    ///
    /// 途中で失敗したら `NamedTempFile` の drop で一時ファイルは消える。
    async fn stage(&self, target: &Path, mut body: ObjectBody<'_>) -> Result<(NamedTempFile, String), StoreError> {
        let parent = target
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(target.display().to_string()))?
            .to_path_buf();
        let staged = self
            .blocking(move |_| {
                fs::create_dir_all(&parent)?;
                Ok(tempfile::Builder::new()
                    .prefix(STAGING_PREFIX)
                    .tempfile_in(&parent)?)
            })
            .await?;

        let mut file = tokio::fs::File::from_std(staged.as_file().try_clone()?);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((staged, format!("{:x}", hasher.finalize())))
    }
}

fn object_path(bucket_dir: &Path, key: &str) -> Result<PathBuf, StoreError> {
    let invalid = || StoreError::InvalidKey(key.to_string());
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(invalid());
    }
    let mut path = bucket_dir.to_path_buf();
    for segment in key.split('/') {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.starts_with(INTERNAL_PREFIX)
        {
            return Err(invalid());
        }
        path.push(segment);
    }
    Ok(path)
}

fn version_of(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// 既存オブジェクトの version。なければ `None`。
fn current_version(path: &Path) -> Result<Option<String>, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(Some(format!("{:x}", hasher.finalize())))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn lock_bucket(bucket_dir: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(bucket_dir.join(LOCK_FILE))?;
    file.lock_exclusive()?;
    Ok(file)
}

/// ロック下で precondition を確認し、満たしていれば一時ファイルを rename する
fn commit_staged(
    bucket_dir: &Path,
    path: &Path,
    staged: NamedTempFile,
    version: String,
    precondition: &WritePrecondition,
) -> Result<WriteOutcome, StoreError> {
    let lock = lock_bucket(bucket_dir)?;
    let current = match precondition {
        WritePrecondition::None => None,
        _ => current_version(path)?,
    };
    let satisfied = match precondition {
        WritePrecondition::None => true,
        WritePrecondition::DoesNotExist => current.is_none(),
        WritePrecondition::MatchesVersion(expected) => current.as_ref() == Some(expected),
    };
    let outcome = if satisfied {
        staged.persist(path).map_err(|e| StoreError::Io(e.error))?;
        WriteOutcome::Written { version }
    } else {
        WriteOutcome::PreconditionFailed {
            current_version: current,
        }
    };
    FileExt::unlock(&lock)?;
    Ok(outcome)
}

fn collect_keys(dir: &Path, base: &str, prefix: &str, out: &mut Vec<String>) -> Result<(), StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(INTERNAL_PREFIX) {
            continue;
        }
        let key = if base.is_empty() {
            name
        } else {
            format!("{base}/{name}")
        };
        if entry.file_type()?.is_dir() {
            // prefix と交わらないサブツリーは降りない
            let as_dir = format!("{key}/");
            if as_dir.starts_with(prefix) || prefix.starts_with(&as_dir) {
                collect_keys(&entry.path(), &key, prefix, out)?;
            }
        } else if key.starts_with(prefix) {
            out.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalDirObjectStore {
    async fn put(
        &self,
        key: &str,
        body: ObjectBody<'_>,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome, StoreError> {
        let path = object_path(&self.bucket_dir, key)?;
        let (staged, version) = self.stage(&path, body).await?;
        self.blocking(move |dir| commit_staged(dir, &path, staged, version, &precondition))
            .await
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let key = key.to_string();
        self.blocking(move |dir| {
            let path = object_path(dir, &key)?;
            let data = read_optional(&path)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            Ok(StoredObject {
                version: version_of(&data),
                data: Bytes::from(data),
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |dir| {
            let path = object_path(dir, &key)?;
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_string();
        self.blocking(move |dir| {
            let mut keys = Vec::new();
            collect_keys(dir, "", &prefix, &mut keys)?;
            keys.sort();
            Ok(keys)
        })
        .await
    }
}
