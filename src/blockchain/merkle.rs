use sha2::{Digest, Sha256};

/// A node in the Merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    pub hash: Vec<u8>,
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
}

impl MerkleNode {
    fn leaf(data: &[u8]) -> Self {
        MerkleNode {
            hash: Sha256::digest(data).to_vec(),
            left: None,
            right: None,
        }
    }

    fn parent(left: MerkleNode, right: MerkleNode) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&left.hash);
        hasher.update(&right.hash);

        MerkleNode {
            hash: hasher.finalize().to_vec(),
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
        }
    }
}

/// A binary Merkle tree over transaction fingerprints.
///
/// A level with an odd number of nodes pairs its last node with itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    pub root: MerkleNode,
}

impl MerkleTree {
    /// Builds the tree from the leaf data in order
    pub fn build<T: AsRef<[u8]>>(data: &[T]) -> MerkleTree {
        let mut level: Vec<MerkleNode> = data.iter().map(|d| MerkleNode::leaf(d.as_ref())).collect();

        if level.is_empty() {
            return MerkleTree {
                root: MerkleNode {
                    hash: vec![0u8; 32],
                    left: None,
                    right: None,
                },
            };
        }

        while level.len() > 1 {
            let mut next_level = Vec::with_capacity((level.len() + 1) / 2);
            let mut nodes = level.into_iter();
            while let Some(left) = nodes.next() {
                let right = nodes.next().unwrap_or_else(|| left.clone());
                next_level.push(MerkleNode::parent(left, right));
            }
            level = next_level;
        }

        let root = level.remove(0);
        MerkleTree { root }
    }

    pub fn root_hash(&self) -> &[u8] {
        &self.root.hash
    }
}
