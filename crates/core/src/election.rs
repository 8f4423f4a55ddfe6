//! Deterministic leader election.
//!
//! Election is a pure function over the set of alive candidates and their
//! tags. Every node computes it independently from its own peer view;
//! because the rank is total and deterministic, agreement is eventual
//! without any voting protocol.

use crate::types::NodeId;

/// Tag that makes a node preferred for leadership.
pub const TAG_LEADER: &str = "leader";

/// Tag that makes a node lead only as a last resort.
pub const TAG_NOLEADER: &str = "noleader";

/// One election candidate: a node id plus its tag-derived rank inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: NodeId,
    pub has_leader_tag: bool,
    pub has_noleader_tag: bool,
}

impl Candidate {
    pub fn new(node_id: impl Into<NodeId>, tags: &[String]) -> Self {
        Self {
            node_id: node_id.into(),
            has_leader_tag: tags.iter().any(|t| t == TAG_LEADER),
            has_noleader_tag: tags.iter().any(|t| t == TAG_NOLEADER),
        }
    }
}

/// Pick the leader from the candidate set.
///
/// Rank: `leader`-tagged nodes first, `noleader`-tagged nodes last,
/// lexicographic node-id tiebreak. Returns `None` only for an empty set.
/// A stopped node is still a valid candidate -- it coordinates without
/// rendering -- so callers pass every alive node, not just active ones.
pub fn elect(candidates: &[Candidate]) -> Option<NodeId> {
    candidates
        .iter()
        .min_by(|a, b| {
            // true before false: leader tag wins.
            b.has_leader_tag
                .cmp(&a.has_leader_tag)
                // false before true: noleader tag loses.
                .then(a.has_noleader_tag.cmp(&b.has_noleader_tag))
                .then(a.node_id.cmp(&b.node_id))
        })
        .map(|c| c.node_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, tags: &[&str]) -> Candidate {
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        Candidate::new(id, &tags)
    }

    #[test]
    fn empty_set_has_no_leader() {
        assert_eq!(elect(&[]), None);
    }

    #[test]
    fn single_candidate_wins() {
        assert_eq!(elect(&[cand("a", &[])]), Some("a".into()));
    }

    #[test]
    fn lexicographic_tiebreak() {
        let winner = elect(&[cand("charlie", &[]), cand("alpha", &[]), cand("bravo", &[])]);
        assert_eq!(winner, Some("alpha".into()));
    }

    #[test]
    fn leader_tag_beats_lexicographic_order() {
        let winner = elect(&[cand("alpha", &[]), cand("zulu", &["leader"])]);
        assert_eq!(winner, Some("zulu".into()));
    }

    #[test]
    fn noleader_tag_loses_to_untagged() {
        let winner = elect(&[cand("alpha", &["noleader"]), cand("zulu", &[])]);
        assert_eq!(winner, Some("zulu".into()));
    }

    #[test]
    fn noleader_wins_as_last_resort() {
        let winner = elect(&[cand("only", &["noleader"])]);
        assert_eq!(winner, Some("only".into()));
    }

    #[test]
    fn leader_tag_beats_noleader_on_same_node_set() {
        let winner = elect(&[
            cand("a", &["noleader"]),
            cand("b", &["leader"]),
            cand("c", &[]),
        ]);
        assert_eq!(winner, Some("b".into()));
    }

    #[test]
    fn election_is_order_independent() {
        let mut set = vec![
            cand("n3", &[]),
            cand("n1", &["noleader"]),
            cand("n2", &["leader"]),
            cand("n4", &[]),
        ];
        let expected = elect(&set);
        set.reverse();
        assert_eq!(elect(&set), expected);
        set.swap(0, 2);
        assert_eq!(elect(&set), expected);
    }

    #[test]
    fn two_observers_agree() {
        // Same alive set observed by two nodes -- both must compute the
        // same winner regardless of which node is "self".
        let view_a = vec![cand("a", &[]), cand("b", &[]), cand("c", &[])];
        let view_b = vec![cand("c", &[]), cand("a", &[]), cand("b", &[])];
        assert_eq!(elect(&view_a), elect(&view_b));
        assert_eq!(elect(&view_a), Some("a".into()));
    }
}
