//! Shard-to-peer assignment.

use std::collections::BTreeMap;

/// Compute a balanced assignment of shards to peers.
///
/// For each shard in order, the peer with the fewest assignments among
/// those not already holding it receives a copy, until `replicas` copies
/// are placed or no eligible peer remains. Ties go to the earliest peer,
/// so the assignment is deterministic in the input ordering and differs
/// minimally across successive peer-set changes. Every input peer appears
/// in the output, possibly with an empty list.
pub(crate) fn distribute(peers: &[String], shards: &[String], replicas: usize) -> BTreeMap<String, Vec<String>> {
    let mut assigned: Vec<Vec<String>> = vec![vec![]; peers.len()];
    for shard in shards {
        for _ in 0..replicas {
            let mut target: Option<usize> = None;
            for (index, list) in assigned.iter().enumerate() {
                if list.contains(shard) {
                    continue;
                }
                match target {
                    Some(current) if assigned[current].len() <= list.len() => (),
                    _ => target = Some(index),
                }
            }
            match target {
                Some(index) => assigned[index].push(shard.clone()),
                None => break,
            }
        }
    }
    peers.iter().cloned().zip(assigned).collect()
}
