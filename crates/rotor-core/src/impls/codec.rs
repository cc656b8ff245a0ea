//! RotationCodec の実装
//!
//! - **YamlCodec**: デフォルト。既存の YAML rotation document をそのまま読める
//! - **JsonCodec**: JSON 形式

use std::collections::BTreeMap;

use crate::domain::{ArtifactId, RotationIndex};
use crate::error::CodecError;
use crate::ports::RotationCodec;

type Generations = BTreeMap<String, Vec<ArtifactId>>;

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl RotationCodec for YamlCodec {
    fn encode(&self, index: &RotationIndex) -> Result<Vec<u8>, CodecError> {
        Ok(serde_yaml::to_string(index)?.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<RotationIndex, CodecError> {
        if is_blank(bytes) {
            return Ok(RotationIndex::new());
        }
        // `~` / `null` の document も空の index
        let generations: Option<Generations> = serde_yaml::from_slice(bytes)?;
        Ok(generations.map(RotationIndex::from).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl RotationCodec for JsonCodec {
    fn encode(&self, index: &RotationIndex) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec_pretty(index)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RotationIndex, CodecError> {
        if is_blank(bytes) {
            return Ok(RotationIndex::new());
        }
        let generations: Option<Generations> = serde_json::from_slice(bytes)?;
        Ok(generations.map(RotationIndex::from).unwrap_or_default())
    }
}
