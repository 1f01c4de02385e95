//! Merkle root construction over an ordered transaction list
//!
//! Leaves are per-transaction content hashes. Each level pairs adjacent
//! nodes, hashing the concatenation of the two hex strings; an odd trailing
//! node is paired with itself. An empty list is a defined state (genesis and
//! empty blocks) whose root is the hash of the empty string.

use crate::crypto::hash_hex;
use crate::transaction::Transaction;

/// Compute the Merkle root of the given transactions.
pub fn merkle_root(transactions: &[Transaction]) -> String {
    let leaves: Vec<String> = transactions.iter().map(|tx| tx.hash()).collect();
    merkle_root_of_hashes(leaves)
}

fn merkle_root_of_hashes(mut level: Vec<String>) -> String {
    if level.is_empty() {
        return hash_hex(b"");
    }

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(hash_hex(format!("{}{}", left, right).as_bytes()));
        }
        level = next;
    }

    level.remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(amount: u64) -> Transaction {
        Transaction::new("sender", "receiver", amount, 1, Some(1000), "")
    }

    #[test]
    fn test_empty_list_hashes_empty_string() {
        assert_eq!(merkle_root(&[]), hash_hex(b""));
    }

    #[test]
    fn test_single_leaf_is_its_own_root() {
        let t = tx(1);
        assert_eq!(merkle_root(std::slice::from_ref(&t)), t.hash());
    }

    #[test]
    fn test_pair_is_hash_of_concatenation() {
        let (a, b) = (tx(1), tx(2));
        let expected = hash_hex(format!("{}{}", a.hash(), b.hash()).as_bytes());
        assert_eq!(merkle_root(&[a, b]), expected);
    }

    #[test]
    fn test_odd_leaf_pairs_with_itself() {
        let (a, b, c) = (tx(1), tx(2), tx(3));
        let left = hash_hex(format!("{}{}", a.hash(), b.hash()).as_bytes());
        let right = hash_hex(format!("{}{}", c.hash(), c.hash()).as_bytes());
        let expected = hash_hex(format!("{}{}", left, right).as_bytes());
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_order_sensitive() {
        let (a, b) = (tx(1), tx(2));
        assert_ne!(
            merkle_root(&[a.clone(), b.clone()]),
            merkle_root(&[b, a])
        );
    }
}
