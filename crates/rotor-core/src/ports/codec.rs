//! RotationCodec port - rotation document のシリアライズ形式
//!
//! document の形は `mapping<string, sequence<string>>` に固定。
//! それ以外の形（スカラー、ネストした mapping など）は decode 時に拒否する。
//! 空の document は空の index として扱う（エラーにしない）。

use crate::domain::RotationIndex;
use crate::error::CodecError;

pub trait RotationCodec: Send + Sync {
    fn encode(&self, index: &RotationIndex) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<RotationIndex, CodecError>;
}
