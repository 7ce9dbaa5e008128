//! Highest-random-weight target selection.

use atoll_types::{Node, Smap};

/// Placement failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("no active targets in cluster map v{0}")]
    NoActiveTargets(u64),
    #[error("target {0} advertises no public endpoint")]
    NoPublicEndpoint(String),
}

/// Per-(key, node) score: first 8 LE bytes of `blake3(node_id ‖ uname)`.
fn score(node_id: &str, uname: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(node_id.as_bytes());
    hasher.update(uname.as_bytes());
    let hash = hasher.finalize();
    let bytes: [u8; 8] = hash.as_bytes()[..8].try_into().expect("8 bytes");
    u64::from_le_bytes(bytes)
}

/// Select the owning target for `uname` from an Smap snapshot.
///
/// Scans active targets in node-id order; strictly-greater comparison
/// keeps the lexicographically-first node on (astronomically unlikely)
/// score ties.
pub fn hrw_target<'a>(uname: &str, smap: &'a Smap) -> Result<&'a Node, PlacementError> {
    let mut winner: Option<(&Node, u64)> = None;
    for node in smap.active_targets() {
        let s = score(node.id.as_str(), uname);
        match winner {
            Some((_, best)) if s <= best => {}
            _ => winner = Some((node, s)),
        }
    }
    winner
        .map(|(n, _)| n)
        .ok_or(PlacementError::NoActiveTargets(smap.version))
}

/// Select the owning target and the preferred public endpoint.
///
/// When the winning target advertises multiple public networks, the
/// endpoint is chosen by an independent secondary hash of the uname over
/// the endpoint list, so clients spread across the target's interfaces
/// while a given key always redirects to the same one.
pub fn hrw_multihome<'a>(uname: &str, smap: &'a Smap) -> Result<(&'a Node, &'a str), PlacementError> {
    let node = hrw_target(uname, smap)?;
    if node.pub_urls.is_empty() {
        return Err(PlacementError::NoPublicEndpoint(node.id.to_string()));
    }
    if node.pub_urls.len() == 1 {
        return Ok((node, &node.pub_urls[0]));
    }
    let idx = (score("pub-endpoint", uname) % node.pub_urls.len() as u64) as usize;
    Ok((node, &node.pub_urls[idx]))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use atoll_types::{Bck, NodeId, NodeRole, NodeState, Smap};

    use super::*;

    fn target(id: &str, pub_urls: &[&str]) -> Node {
        Node {
            id: NodeId::from(id),
            role: NodeRole::Target,
            pub_urls: pub_urls.iter().map(|u| u.to_string()).collect(),
            intra_url: format!("http://{id}:9080"),
            mover_id: None,
            mover_addrs: vec![],
            state: NodeState::Active,
        }
    }

    fn smap_with(n: usize) -> Smap {
        let mut tmap = BTreeMap::new();
        for i in 0..n {
            let id = format!("t-{i:02}");
            tmap.insert(NodeId::new(id.clone()), target(&id, &["http://x:8080"]));
        }
        Smap {
            version: 1,
            primary: NodeId::from("p-00"),
            pmap: BTreeMap::new(),
            tmap,
        }
    }

    fn unames(n: usize) -> Vec<String> {
        let bck = Bck::native("b1");
        (0..n).map(|i| bck.make_uname(&format!("obj/{i:06}"))).collect()
    }

    #[test]
    fn test_empty_smap_is_an_error() {
        let smap = smap_with(0);
        assert_eq!(
            hrw_target("k", &smap),
            Err(PlacementError::NoActiveTargets(1))
        );
    }

    #[test]
    fn test_single_target_owns_everything() {
        let smap = smap_with(1);
        for u in unames(100) {
            assert_eq!(hrw_target(&u, &smap).unwrap().id.as_str(), "t-00");
        }
    }

    #[test]
    fn test_deterministic_selection() {
        let smap_a = smap_with(5);
        let smap_b = smap_with(5);
        for u in unames(500) {
            assert_eq!(
                hrw_target(&u, &smap_a).unwrap().id,
                hrw_target(&u, &smap_b).unwrap().id
            );
        }
    }

    #[test]
    fn test_roughly_balanced_across_targets() {
        let smap = smap_with(4);
        let mut counts: HashMap<String, usize> = HashMap::new();
        let total = 10_000;
        for u in unames(total) {
            *counts
                .entry(hrw_target(&u, &smap).unwrap().id.to_string())
                .or_default() += 1;
        }
        for (id, count) in &counts {
            let share = *count as f64 / total as f64;
            assert!(
                (0.15..=0.35).contains(&share),
                "target {id} holds a skewed share: {share:.2}"
            );
        }
    }

    #[test]
    fn test_adding_target_moves_about_one_nth() {
        let before = smap_with(4);
        let mut after = smap_with(4);
        after
            .tmap
            .insert(NodeId::from("t-99"), target("t-99", &["http://x:8080"]));
        after.version = 2;

        let keys = unames(10_000);
        let moved = keys
            .iter()
            .filter(|u| hrw_target(u, &before).unwrap().id != hrw_target(u, &after).unwrap().id)
            .count();

        // Expect ~1/5 of keys to move to the new target.
        let ratio = moved as f64 / keys.len() as f64;
        assert!(
            (0.1..=0.3).contains(&ratio),
            "movement out of bounds: {moved}/{} ({ratio:.2})",
            keys.len()
        );

        // And every moved key must have moved TO the new target.
        for u in &keys {
            let b = hrw_target(u, &before).unwrap().id.clone();
            let a = hrw_target(u, &after).unwrap().id.clone();
            if b != a {
                assert_eq!(a.as_str(), "t-99");
            }
        }
    }

    #[test]
    fn test_removing_target_redistributes_only_its_keys() {
        let before = smap_with(4);
        let mut after = before.clone();
        after.tmap.remove(&NodeId::from("t-02"));
        after.version = 2;

        for u in unames(5_000) {
            let b = hrw_target(&u, &before).unwrap().id.clone();
            let a = hrw_target(&u, &after).unwrap().id.clone();
            if b.as_str() != "t-02" {
                assert_eq!(b, a, "key moved although its owner survived");
            } else {
                assert_ne!(a.as_str(), "t-02");
            }
        }
    }

    #[test]
    fn test_maintenance_targets_excluded() {
        let mut smap = smap_with(3);
        smap.tmap.get_mut(&NodeId::from("t-01")).unwrap().state = NodeState::Maintenance;
        for u in unames(1_000) {
            assert_ne!(hrw_target(&u, &smap).unwrap().id.as_str(), "t-01");
        }
    }

    #[test]
    fn test_multihome_is_deterministic_and_spreads() {
        let mut smap = smap_with(0);
        smap.tmap.insert(
            NodeId::from("t-00"),
            target("t-00", &["http://a:8080", "http://b:8080", "http://c:8080"]),
        );

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for u in unames(3_000) {
            let (_, url1) = hrw_multihome(&u, &smap).unwrap();
            let (_, url2) = hrw_multihome(&u, &smap).unwrap();
            assert_eq!(url1, url2);
            *seen.entry(url1).or_default() += 1;
        }
        // All three endpoints should be used.
        assert_eq!(seen.len(), 3, "endpoints used: {seen:?}");
    }

    #[test]
    fn test_multihome_single_endpoint() {
        let smap = smap_with(2);
        let (node, url) = hrw_multihome(&unames(1)[0], &smap).unwrap();
        assert_eq!(url, node.pub_urls[0]);
    }
}
