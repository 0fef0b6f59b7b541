//! ORB vocabulary for bag-of-words matching.
//!
//! A hierarchical k-means tree over binary descriptors in the DBoW2 text
//! format. Transforming a frame's descriptors yields:
//!
//! - [`BowVector`]: visual word -> L1-normalized TF-IDF weight, used by the
//!   keyframe database.
//! - [`FeatureVector`]: tree node (a few levels above the leaves) -> feature
//!   indices, enabling the joint sorted walk the matcher uses to only
//!   compare descriptors quantized to the same node.
//!
//! Both are ordered maps so two vectors can be walked jointly by node id.

pub mod keyframe_db;

pub use keyframe_db::KeyFrameDatabase;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::frame::descriptor::Descriptor;

/// Visual word id -> TF-IDF weight, L1-normalized.
pub type BowVector = BTreeMap<u32, f64>;

/// Tree node id -> indices of the features quantized under that node.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Levels above the leaves at which features are grouped for matching.
const FEATURE_VECTOR_LEVELS_UP: usize = 4;

const ROOT_PARENT: u32 = u32::MAX;

/// A node in the vocabulary tree.
#[derive(Debug, Clone)]
struct VocabNode {
    parent: u32,
    children: Vec<u32>,
    descriptor: Descriptor,
    /// IDF weight; non-zero only for leaves.
    weight: f64,
    word_id: Option<u32>,
}

impl VocabNode {
    fn new(parent: u32) -> Self {
        Self {
            parent,
            children: Vec::new(),
            descriptor: Descriptor::default(),
            weight: 0.0,
            word_id: None,
        }
    }
}

/// Vocabulary tree over 256-bit binary descriptors.
#[derive(Debug)]
pub struct OrbVocabulary {
    nodes: Vec<VocabNode>,
    num_words: usize,
    k: usize,
    l: usize,
}

impl OrbVocabulary {
    /// Load a vocabulary from the DBoW2 text format.
    ///
    /// Line 1 is `k L scoring weighting`; every further line is one node:
    /// `parent_id is_leaf byte[0..32] weight`.
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("opening vocabulary {}", path.as_ref().display()))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = lines
            .next()
            .context("vocabulary file is empty")?
            .context("reading vocabulary header")?;
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            bail!("invalid vocabulary header, expected: k L [scoring weighting]");
        }
        let k: usize = header_parts[0].parse().context("parsing k")?;
        let l: usize = header_parts[1].parse().context("parsing L")?;

        let mut nodes = vec![VocabNode::new(ROOT_PARENT)];
        let mut num_words = 0usize;

        for (line_num, line) in lines.enumerate() {
            let line = line.with_context(|| format!("reading vocabulary line {}", line_num + 2))?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 35 {
                continue;
            }

            let parent_id: u32 = parts[0]
                .parse()
                .with_context(|| format!("parent id at line {}", line_num + 2))?;
            let is_leaf = parts[1] == "1";

            let mut bytes = [0u8; 32];
            for (i, byte_str) in parts[2..34].iter().enumerate() {
                bytes[i] = byte_str
                    .parse()
                    .with_context(|| format!("descriptor byte at line {}", line_num + 2))?;
            }
            let weight: f64 = parts[34]
                .parse()
                .with_context(|| format!("weight at line {}", line_num + 2))?;

            let node_id = nodes.len() as u32;
            let mut node = VocabNode::new(parent_id);
            node.descriptor = Descriptor::from_bytes(&bytes);
            node.weight = weight;
            if is_leaf {
                node.word_id = Some(num_words as u32);
                num_words += 1;
            }
            if (parent_id as usize) < nodes.len() {
                nodes[parent_id as usize].children.push(node_id);
            }
            nodes.push(node);
        }

        info!(
            k,
            l,
            nodes = nodes.len(),
            words = num_words,
            "loaded vocabulary"
        );
        Ok(Self {
            nodes,
            num_words,
            k,
            l,
        })
    }

    /// Build a flat single-level vocabulary directly from word descriptors.
    ///
    /// Every word is a direct child of the root. Matching loses the tree
    /// speed-up but keeps identical semantics; mainly useful for synthetic
    /// data and tests.
    pub fn from_words(words: Vec<Descriptor>) -> Self {
        let mut nodes = vec![VocabNode::new(ROOT_PARENT)];
        let num_words = words.len();
        for (i, descriptor) in words.into_iter().enumerate() {
            let node_id = nodes.len() as u32;
            nodes[0].children.push(node_id);
            nodes.push(VocabNode {
                parent: 0,
                children: Vec::new(),
                descriptor,
                weight: 1.0,
                word_id: Some(i as u32),
            });
        }
        let k = num_words.max(1);
        Self {
            nodes,
            num_words,
            k,
            l: 1,
        }
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    /// Quantize one descriptor: descend the tree following the closest child
    /// at each level. Returns (leaf node id, word id, weight).
    fn quantize(&self, descriptor: &Descriptor) -> (u32, u32, f64) {
        let mut node_id = 0usize;
        while !self.nodes[node_id].children.is_empty() {
            let mut best_child = self.nodes[node_id].children[0];
            let mut best_dist = descriptor.distance(&self.nodes[best_child as usize].descriptor);
            for &child in &self.nodes[node_id].children[1..] {
                let dist = descriptor.distance(&self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
        }
        let node = &self.nodes[node_id];
        (node_id as u32, node.word_id.unwrap_or(0), node.weight)
    }

    /// Ancestor `levels_up` levels above a node (clamped at the root).
    fn parent_at_level(&self, node_id: u32, levels_up: usize) -> u32 {
        let mut node_id = node_id;
        for _ in 0..levels_up {
            let parent = self.nodes[node_id as usize].parent;
            if parent == ROOT_PARENT {
                break;
            }
            node_id = parent;
        }
        node_id
    }

    /// Transform a descriptor set into its bag-of-words representation.
    pub fn transform(&self, descriptors: &[Descriptor]) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();

        for (i, descriptor) in descriptors.iter().enumerate() {
            let (leaf_id, word_id, weight) = self.quantize(descriptor);
            if weight > 0.0 {
                *bow.entry(word_id).or_insert(0.0) += weight;
            }
            let node = self.parent_at_level(leaf_id, FEATURE_VECTOR_LEVELS_UP);
            features.entry(node).or_default().push(i);
        }

        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            for v in bow.values_mut() {
                *v /= sum;
            }
        }

        (bow, features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(bits: u32) -> Descriptor {
        Descriptor([bits, 0, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_flat_vocabulary_quantization() {
        let vocab = OrbVocabulary::from_words(vec![word(0), word(0xFFFF_FFFF)]);
        assert_eq!(vocab.num_words(), 2);

        let descriptors = vec![word(0b1), word(0xFFFF_FFF0), word(0)];
        let (bow, features) = vocab.transform(&descriptors);

        // Words 0 and 1 both hit; weights normalized.
        let total: f64 = bow.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(bow.len(), 2);

        // Flat tree: every feature groups under the root node.
        let all: Vec<usize> = features.values().flatten().copied().collect();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_feature_vector_is_sorted_by_node() {
        let vocab = OrbVocabulary::from_words((0..8).map(|i| word(1 << i)).collect());
        let descriptors: Vec<Descriptor> = (0..8).map(|i| word(1 << i)).collect();
        let (_, features) = vocab.transform(&descriptors);
        let keys: Vec<u32> = features.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_empty_descriptor_set() {
        let vocab = OrbVocabulary::from_words(vec![word(0)]);
        let (bow, features) = vocab.transform(&[]);
        assert!(bow.is_empty());
        assert!(features.is_empty());
    }
}
