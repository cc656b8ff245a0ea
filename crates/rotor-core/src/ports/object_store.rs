//! ObjectStore port - バックアップ先のオブジェクトストア（S3 / ローカルディレクトリ / InMemory）
//!
//! フラットな key → bytes の名前空間と prefix listing だけを前提にします。
//! bucket の作成・接続の確立はこの trait の外（構築前）で済ませておくこと。
//!
//! # 条件付き書き込み
//! rotation document の read-modify-write を安全にするため、`get` は version token を返し、
//! `put` は `WritePrecondition` を受け取ります（compare-and-swap）。
//! 通常の artifact のアップロードは `WritePrecondition::None` を使う。
//!
//! # ストリーミング
//! `put` の本体は `ObjectBody`（長さ固定の AsyncRead）で渡す。
//! 実装は本体を丸ごとメモリに載せずに、読みながら書き出すこと。

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

use crate::error::StoreError;

/// Condition a `put` must satisfy to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write unconditionally (last writer wins).
    None,
    /// Write only if no object exists under the key.
    DoesNotExist,
    /// Write only if the current object's version equals the token.
    MatchesVersion(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: String },
    /// `current_version` is `None` when the object does not exist.
    PreconditionFailed { current_version: Option<String> },
}

/// Object bytes together with the version token they were read at.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub version: String,
}

/// Error raised by the reader behind an `ObjectBody`.
///
/// A store only sees an `io::Error` while copying the body; this handle lets
/// the caller tell a failing source apart from a failing backend.
#[derive(Debug, Clone, Default)]
pub struct SourceFault(Arc<Mutex<Option<io::Error>>>);

impl SourceFault {
    fn record(&self, err: &io::Error) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert_with(|| io::Error::new(err.kind(), err.to_string()));
    }

    pub fn take(&self) -> Option<io::Error> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// `put` に渡すオブジェクト本体
///
/// 元の reader からちょうど `content_length` バイトを流す。
/// 元の reader がそれより手前で終わったら `UnexpectedEof`、それ以降は読まない。
pub struct ObjectBody<'a> {
    reader: Take<Pin<Box<dyn AsyncRead + Send + 'a>>>,
    content_length: u64,
    fault: SourceFault,
}

impl<'a> ObjectBody<'a> {
    pub fn new(reader: impl AsyncRead + Send + 'a, content_length: u64) -> Self {
        let reader: Pin<Box<dyn AsyncRead + Send + 'a>> = Box::pin(reader);
        Self {
            reader: reader.take(content_length),
            content_length,
            fault: SourceFault::default(),
        }
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn fault(&self) -> SourceFault {
        self.fault.clone()
    }

    /// 本体を全部読んでバッファに載せる（小さい document とテスト用ストア向け）
    pub async fn into_bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::with_capacity(usize::try_from(self.content_length).unwrap_or(0));
        self.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

impl From<Bytes> for ObjectBody<'static> {
    fn from(data: Bytes) -> Self {
        let len = data.len() as u64;
        ObjectBody::new(io::Cursor::new(data), len)
    }
}

impl From<Vec<u8>> for ObjectBody<'static> {
    fn from(data: Vec<u8>) -> Self {
        Bytes::from(data).into()
    }
}

impl AsyncRead for ObjectBody<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let wants_data = buf.remaining() > 0;
        match Pin::new(&mut this.reader).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                this.fault.record(&err);
                Poll::Ready(Err(err))
            }
            Poll::Ready(Ok(())) => {
                let missing = this.reader.limit();
                if wants_data && buf.filled().len() == before && missing > 0 {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("source ended {missing} bytes short of {}", this.content_length),
                    );
                    this.fault.record(&err);
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

/// ObjectStore はバックアップ先のストレージ
///
/// # 契約
/// - `get`: 存在しない key は `StoreError::NotFound`
/// - `put`: 本体は `ObjectBody` から読みながら書く。読み出しエラーはそのまま `StoreError::Io` で返してよい
/// - `delete`: 冪等（存在しない key を消してもエラーにしない）
/// - `list_by_prefix`: 一致なしは空の Vec（エラーではない）、辞書順
/// - タイムアウト・リトライは実装側の責任（core はリトライしない）
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        body: ObjectBody<'_>,
        precondition: WritePrecondition,
    ) -> Result<WriteOutcome, StoreError>;

    async fn get(&self, key: &str) -> Result<StoredObject, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
