use sha2::{Digest, Sha256};

use crate::{Commitment, CommitmentError, NODE_SIZE};

/// Binary merkle tree over opaque byte leaves.
///
/// Leaf nodes are `SHA-256(leaf)`, internal nodes are
/// `SHA-256(left || right)`. A layer with an odd node count promotes its last
/// node by pairing it with itself. Given the same ordered leaves, the root is
/// byte-identical across implementations; the root is part of the on-chain
/// wire contract.
pub struct MerkleTree {
    /// Bottom-up layers; `layers[0]` are the leaf hashes, the last layer is
    /// the root alone.
    layers: Vec<Vec<[u8; NODE_SIZE]>>,
}

impl MerkleTree {
    /// Hashes every leaf and reduces the tree to its root.
    pub fn build<L>(leaves: &[L]) -> Result<Self, CommitmentError>
    where
        L: AsRef<[u8]>,
    {
        if leaves.is_empty() {
            return Err(CommitmentError::EmptyLeaves);
        }

        let mut layers = Vec::new();
        let mut current: Vec<[u8; NODE_SIZE]> =
            leaves.iter().map(|leaf| hash_node(leaf.as_ref())).collect();

        while current.len() > 1 {
            let next = reduce_layer(&current);
            layers.push(core::mem::replace(&mut current, next));
        }
        layers.push(current);

        Ok(Self { layers })
    }

    /// The 32-byte merkle root.
    pub fn root(&self) -> Commitment {
        // `build` always leaves a single-node top layer.
        Commitment::from(self.layers[self.layers.len() - 1][0])
    }

    /// Number of leaves the tree was built from.
    pub fn leaf_count(&self) -> usize {
        self.layers[0].len()
    }
}

fn hash_node(data: &[u8]) -> [u8; NODE_SIZE] {
    let digest = Sha256::digest(data);
    let mut node = [0; NODE_SIZE];
    node.copy_from_slice(&digest);
    node
}

fn reduce_layer(nodes: &[[u8; NODE_SIZE]]) -> Vec<[u8; NODE_SIZE]> {
    let mut parents = Vec::with_capacity(nodes.len().div_ceil(2));
    for pair in nodes.chunks(2) {
        let left = &pair[0];
        // Odd layer: the last node is paired with itself.
        let right = pair.get(1).unwrap_or(left);
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(right);
        let mut node = [0; NODE_SIZE];
        node.copy_from_slice(&hasher.finalize());
        parents.push(node);
    }
    parents
}

#[cfg(test)]
mod tests {
    use rand::RngCore;
    use sha2::{Digest, Sha256};

    use super::MerkleTree;
    use crate::CommitmentError;

    fn rand_leaves(n: usize, len: usize) -> Vec<Vec<u8>> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| {
                let mut leaf = vec![0u8; len];
                rng.fill_bytes(&mut leaf);
                leaf
            })
            .collect()
    }

    #[test]
    fn empty_leaves_rejected() {
        let leaves: Vec<Vec<u8>> = Vec::new();
        assert!(matches!(
            MerkleTree::build(&leaves),
            Err(CommitmentError::EmptyLeaves)
        ));
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let tree = MerkleTree::build(&[b"lambda"]).unwrap();
        let expected: [u8; 32] = Sha256::digest(b"lambda").into();
        assert_eq!(tree.root().raw(), expected);
    }

    #[test]
    fn two_leaves_root() {
        let tree = MerkleTree::build(&[b"left".to_vec(), b"right".to_vec()]).unwrap();

        let left: [u8; 32] = Sha256::digest(b"left").into();
        let right: [u8; 32] = Sha256::digest(b"right").into();
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(right);
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(tree.root().raw(), expected);
    }

    #[test]
    fn odd_layer_promotes_last_node() {
        // Three leaves: the third is hashed against itself one layer up.
        let leaves = rand_leaves(3, 64);
        let tree = MerkleTree::build(&leaves).unwrap();

        let l0: [u8; 32] = Sha256::digest(&leaves[0]).into();
        let l1: [u8; 32] = Sha256::digest(&leaves[1]).into();
        let l2: [u8; 32] = Sha256::digest(&leaves[2]).into();
        let pair = |a: &[u8; 32], b: &[u8; 32]| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(a);
            hasher.update(b);
            hasher.finalize().into()
        };
        let expected = pair(&pair(&l0, &l1), &pair(&l2, &l2));

        assert_eq!(tree.root().raw(), expected);
    }

    #[test]
    fn deterministic_and_order_sensitive() {
        let leaves = rand_leaves(64, 128);
        let a = MerkleTree::build(&leaves).unwrap().root();
        let b = MerkleTree::build(&leaves).unwrap().root();
        assert_eq!(a, b);

        let mut swapped = leaves.clone();
        swapped.swap(0, 63);
        let c = MerkleTree::build(&swapped).unwrap().root();
        assert_ne!(a, c);
    }

    #[test]
    fn leaf_count_preserved() {
        let leaves = rand_leaves(7, 16);
        let tree = MerkleTree::build(&leaves).unwrap();
        assert_eq!(tree.leaf_count(), 7);
    }
}
