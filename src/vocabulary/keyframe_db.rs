//! Inverted-index keyframe database.
//!
//! Maps visual words to the keyframes whose BoW vectors contain them. The
//! tracking core only consumes `detect_relocalization_candidates`; the
//! contract is kept even though relocalization itself is performed by an
//! external collaborator.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::map::KeyFrameId;

use super::BowVector;

#[derive(Debug, Default)]
struct Index {
    /// word id -> keyframes containing that word.
    inverted: HashMap<u32, Vec<KeyFrameId>>,
    /// Stored BoW vectors for scoring.
    vectors: HashMap<KeyFrameId, BowVector>,
}

/// Shared keyframe database. Internal lock protects the inverted index so
/// the mapper can add keyframes while tracking queries candidates.
#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    index: RwLock<Index>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kf_id: KeyFrameId, bow: BowVector) {
        let mut index = self.index.write();
        for &word in bow.keys() {
            index.inverted.entry(word).or_default().push(kf_id);
        }
        index.vectors.insert(kf_id, bow);
    }

    pub fn erase(&self, kf_id: KeyFrameId) {
        let mut index = self.index.write();
        if let Some(bow) = index.vectors.remove(&kf_id) {
            for word in bow.keys() {
                if let Some(list) = index.inverted.get_mut(word) {
                    list.retain(|&id| id != kf_id);
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut index = self.index.write();
        index.inverted.clear();
        index.vectors.clear();
    }

    /// Keyframes sharing enough visual words with the query to be worth a
    /// relocalization attempt, best first.
    ///
    /// Candidates must share at least 80% as many words as the best
    /// candidate does; ties are broken by the L1 BoW similarity score.
    pub fn detect_relocalization_candidates(&self, query: &BowVector) -> Vec<KeyFrameId> {
        let index = self.index.read();

        let mut shared_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.keys() {
            if let Some(kfs) = index.inverted.get(word) {
                for &kf in kfs {
                    *shared_words.entry(kf).or_insert(0) += 1;
                }
            }
        }
        if shared_words.is_empty() {
            return Vec::new();
        }

        let Some(&max_common) = shared_words.values().max() else {
            return Vec::new();
        };
        let min_common = (max_common as f64 * 0.8) as usize;

        let mut scored: Vec<(KeyFrameId, f64)> = shared_words
            .into_iter()
            .filter(|(_, n)| *n >= min_common.max(1))
            .map(|(kf, _)| {
                let score = index
                    .vectors
                    .get(&kf)
                    .map(|bow| l1_score(query, bow))
                    .unwrap_or(0.0);
                (kf, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().map(|(kf, _)| kf).collect()
    }
}

/// DBoW2 L1 similarity: higher is more similar, 1.0 for identical vectors.
fn l1_score(a: &BowVector, b: &BowVector) -> f64 {
    let mut score = 0.0;
    for (word, wa) in a {
        if let Some(wb) = b.get(word) {
            score += wa.abs() + wb.abs() - (wa - wb).abs();
        }
    }
    0.5 * score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(entries: &[(u32, f64)]) -> BowVector {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_candidates_ranked_by_similarity() {
        let db = KeyFrameDatabase::new();
        db.add(KeyFrameId(1), bow(&[(0, 0.5), (1, 0.5)]));
        db.add(KeyFrameId(2), bow(&[(0, 0.1), (2, 0.9)]));

        let query = bow(&[(0, 0.5), (1, 0.5)]);
        let candidates = db.detect_relocalization_candidates(&query);
        assert_eq!(candidates.first(), Some(&KeyFrameId(1)));
    }

    #[test]
    fn test_no_shared_words_no_candidates() {
        let db = KeyFrameDatabase::new();
        db.add(KeyFrameId(1), bow(&[(5, 1.0)]));
        let query = bow(&[(9, 1.0)]);
        assert!(db.detect_relocalization_candidates(&query).is_empty());
    }

    #[test]
    fn test_erase_removes_keyframe() {
        let db = KeyFrameDatabase::new();
        db.add(KeyFrameId(1), bow(&[(0, 1.0)]));
        db.erase(KeyFrameId(1));
        assert!(db
            .detect_relocalization_candidates(&bow(&[(0, 1.0)]))
            .is_empty());
    }
}
