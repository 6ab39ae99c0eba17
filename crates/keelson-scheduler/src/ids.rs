//! Deterministic identifiers.
//!
//! Allocation ids are a SHA-256 digest over the evaluation id, the snapshot
//! index and the allocation name, so the same evaluation processed against
//! the same snapshot always proposes the same allocations.

use sha2::{Digest, Sha256};

use keelson_state::{AllocId, PlanId};

/// Id for a new allocation named `name`, proposed by `eval_id` at `snapshot_index`.
pub fn alloc_id(eval_id: &str, snapshot_index: u64, name: &str) -> AllocId {
    let mut hasher = Sha256::new();
    hasher.update(eval_id.as_bytes());
    hasher.update([0]);
    hasher.update(snapshot_index.to_be_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Id for the plan `eval_id` computes at `snapshot_index`.
pub fn plan_id(eval_id: &str, snapshot_index: u64) -> PlanId {
    format!("{eval_id}@{snapshot_index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_ids_are_stable() {
        let a = alloc_id("e1", 7, "web.api[0]");
        assert_eq!(a, alloc_id("e1", 7, "web.api[0]"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn alloc_ids_differ_per_input() {
        let base = alloc_id("e1", 7, "web.api[0]");
        assert_ne!(base, alloc_id("e2", 7, "web.api[0]"));
        assert_ne!(base, alloc_id("e1", 8, "web.api[0]"));
        assert_ne!(base, alloc_id("e1", 7, "web.api[1]"));
    }
}
