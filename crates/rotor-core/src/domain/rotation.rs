//! RotationIndex - 保持世代の台帳
//!
//! generation 名（"daily", "weekly" など）→ ArtifactId の列（古い順）の対応表です。
//!
//! # 不変条件
//! - 一度存在した generation は merge（`ensure_generations`）で消えない
//! - generation 内の順序は挿入順（= 時系列、古いものが先頭）
//! - identifier の一意性は呼び出し側の責任（検出しない）
//!
//! I/O は持たない。永続化は RotationCodec と BackupStore の役割。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::ArtifactId;
use crate::error::RotorError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RotationIndex {
    generations: BTreeMap<String, Vec<ArtifactId>>,
}

impl RotationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// hierarchy の各 generation を空の列で持つ index
    pub fn with_hierarchy<I, S>(hierarchy: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = Self::new();
        index.ensure_generations(hierarchy);
        index
    }

    pub fn generations(&self) -> &BTreeMap<String, Vec<ArtifactId>> {
        &self.generations
    }

    pub fn generation(&self, name: &str) -> Option<&[ArtifactId]> {
        self.generations.get(name).map(Vec::as_slice)
    }

    pub fn contains_generation(&self, name: &str) -> bool {
        self.generations.contains_key(name)
    }

    /// 足りない generation を空の列で追加する（left-biased merge）
    ///
    /// 既存の generation の列には一切触れない。
    /// 何か追加した場合だけ `true` を返すので、呼び出し側は不要な永続化を省ける。
    pub fn ensure_generations<I, S>(&mut self, required: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for name in required {
            let name = name.into();
            if !self.generations.contains_key(&name) {
                self.generations.insert(name, Vec::new());
                changed = true;
            }
        }
        changed
    }

    /// Drops the oldest identifiers of `generation` until at most `keep` remain.
    ///
    /// Returns the dropped identifiers, oldest first. An absent generation or
    /// `keep >= len` is a no-op returning an empty list.
    pub fn trim(&mut self, generation: &str, keep: usize) -> Vec<ArtifactId> {
        let Some(ids) = self.generations.get_mut(generation) else {
            return Vec::new();
        };
        let excess = ids.len().saturating_sub(keep);
        ids.drain(..excess).collect()
    }

    /// generation の末尾（最新）に identifier を追加
    pub fn record(&mut self, generation: &str, id: ArtifactId) -> Result<(), RotorError> {
        match self.generations.get_mut(generation) {
            Some(ids) => {
                ids.push(id);
                Ok(())
            }
            None => Err(RotorError::UnknownGeneration {
                op: "record",
                generation: generation.to_string(),
            }),
        }
    }

    /// Removes the first occurrence of each of `ids` from `generation`.
    ///
    /// Used to commit a cleanup against a freshly reloaded index: only the
    /// identifiers that were actually deleted disappear, anything another
    /// writer appended in the meantime stays. Returns how many were removed.
    pub fn forget(&mut self, generation: &str, ids: &[ArtifactId]) -> usize {
        let Some(current) = self.generations.get_mut(generation) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if let Some(pos) = current.iter().position(|x| x == id) {
                current.remove(pos);
                removed += 1;
            }
        }
        removed
    }
}

impl From<BTreeMap<String, Vec<ArtifactId>>> for RotationIndex {
    fn from(generations: BTreeMap<String, Vec<ArtifactId>>) -> Self {
        Self { generations }
    }
}
