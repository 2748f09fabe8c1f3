//! Merkle tree calculations for transaction commitment
//!
//! Computes block merkle roots and walks BIP37 partial merkle trees
//! (the payload of `merkleblock`) to recover matched transaction hashes.

use super::hash::{double_sha256, Hash256, ZERO_HASH};

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    double_sha256(&data)
}

/// Calculate the merkle root from a list of transaction hashes
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return ZERO_HASH;
    }

    let mut current_level: Vec<Hash256> = hashes.to_vec();

    while current_level.len() > 1 {
        current_level = current_level
            .chunks(2)
            .map(|chunk| {
                // Duplicate the last hash if odd number
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                hash_pair(&chunk[0], right)
            })
            .collect();
    }

    current_level[0]
}

/// Result of walking a partial merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMatch {
    /// Root committed to by the tree
    pub root: Hash256,
    /// Matched leaves, in block order
    pub matches: Vec<Hash256>,
    /// Leaf positions of the matches
    pub indexes: Vec<u32>,
}

struct Walker<'a> {
    total: u32,
    hashes: &'a [Hash256],
    flags: &'a [u8],
    bits_used: usize,
    hashes_used: usize,
    matches: Vec<Hash256>,
    indexes: Vec<u32>,
}

impl Walker<'_> {
    fn width(&self, height: u32) -> u32 {
        (self.total + (1 << height) - 1) >> height
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Option<Hash256> {
        if self.bits_used >= self.flags.len() * 8 {
            return None;
        }
        let parent_of_match = (self.flags[self.bits_used / 8] >> (self.bits_used % 8)) & 1 == 1;
        self.bits_used += 1;

        if height == 0 || !parent_of_match {
            let hash = *self.hashes.get(self.hashes_used)?;
            self.hashes_used += 1;
            if height == 0 && parent_of_match {
                self.matches.push(hash);
                self.indexes.push(pos);
            }
            return Some(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < self.width(height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            // Identical siblings would allow a duplicated-leaf forgery
            if right == left {
                return None;
            }
            right
        } else {
            left
        };

        Some(hash_pair(&left, &right))
    }
}

fn tree_width(total: u32, height: u32) -> u32 {
    (total + (1 << height) - 1) >> height
}

fn subtree_hash(leaves: &[Hash256], height: u32, pos: u32) -> Hash256 {
    if height == 0 {
        return leaves[pos as usize];
    }
    let total = leaves.len() as u32;
    let left = subtree_hash(leaves, height - 1, pos * 2);
    let right = if pos * 2 + 1 < tree_width(total, height - 1) {
        subtree_hash(leaves, height - 1, pos * 2 + 1)
    } else {
        left
    };
    hash_pair(&left, &right)
}

fn build_node(
    leaves: &[Hash256],
    matched: &[bool],
    height: u32,
    pos: u32,
    hashes: &mut Vec<Hash256>,
    bits: &mut Vec<bool>,
) {
    let total = leaves.len();
    let start = (pos as usize) << height;
    let end = (((pos as usize) + 1) << height).min(total);
    let parent_of_match = matched[start..end].iter().any(|m| *m);
    bits.push(parent_of_match);

    if height == 0 || !parent_of_match {
        hashes.push(subtree_hash(leaves, height, pos));
        return;
    }

    build_node(leaves, matched, height - 1, pos * 2, hashes, bits);
    if pos * 2 + 1 < tree_width(total as u32, height - 1) {
        build_node(leaves, matched, height - 1, pos * 2 + 1, hashes, bits);
    }
}

/// Build a partial merkle tree committing to `leaves`, revealing the
/// leaves flagged in `matched`. Returns `(hashes, flag bytes)`.
pub fn build_partial(leaves: &[Hash256], matched: &[bool]) -> (Vec<Hash256>, Vec<u8>) {
    let mut hashes = Vec::new();
    let mut bits = Vec::new();
    if leaves.is_empty() || leaves.len() != matched.len() {
        return (hashes, Vec::new());
    }

    let total = leaves.len() as u32;
    let mut height = 0;
    while tree_width(total, height) > 1 {
        height += 1;
    }

    build_node(leaves, matched, height, 0, &mut hashes, &mut bits);

    let mut flags = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            flags[i / 8] |= 1 << (i % 8);
        }
    }
    (hashes, flags)
}

/// Walk a partial merkle tree, returning `None` if it is malformed
pub fn extract_matches(
    total: u32,
    hashes: &[Hash256],
    flags: &[u8],
    max_leaves: u32,
) -> Option<PartialMatch> {
    if total == 0 || total > max_leaves {
        return None;
    }
    if hashes.len() as u64 > total as u64 {
        return None;
    }
    if flags.len() * 8 < hashes.len() {
        return None;
    }

    let mut walker = Walker {
        total,
        hashes,
        flags,
        bits_used: 0,
        hashes_used: 0,
        matches: Vec::new(),
        indexes: Vec::new(),
    };

    let mut height = 0;
    while walker.width(height) > 1 {
        height += 1;
    }

    let root = walker.traverse(height, 0)?;

    // Every flag byte and every hash must have been consumed
    if (walker.bits_used + 7) / 8 != flags.len() || walker.hashes_used != hashes.len() {
        return None;
    }

    Some(PartialMatch {
        root,
        matches: walker.matches,
        indexes: walker.indexes,
    })
}
