//! Majority and joint-majority arithmetic over configuration halves.

use crate::persist::{Config, Index, ServerAddress};
use std::collections::{HashMap, HashSet};

/// True when a strict majority of `half` appears in `yes`. An empty half has
/// no say and always agrees.
pub(crate) fn majority_granted(half: &[ServerAddress], yes: &HashSet<ServerAddress>) -> bool {
    if half.is_empty() {
        return true;
    }
    let granted = half.iter().filter(|s| yes.contains(*s)).count();
    granted * 2 > half.len()
}

/// True when every active half of `conf` grants. During joint consensus both
/// the old and new member sets must reach majority independently.
pub(crate) fn joint_granted(conf: &Config, yes: &HashSet<ServerAddress>) -> bool {
    majority_granted(&conf.servers, yes) && majority_granted(&conf.new_servers, yes)
}

/// Highest index durably stored on a majority of `half`, given each member's
/// acknowledged match index. An empty half does not constrain the result.
fn majority_committed(half: &[ServerAddress], matches: &HashMap<ServerAddress, Index>) -> Index {
    if half.is_empty() {
        return Index::new(u64::MAX);
    }
    let mut acked: Vec<Index> = half
        .iter()
        .map(|s| matches.get(s).copied().unwrap_or_default())
        .collect();
    acked.sort_unstable();
    // With n members, the entry at position n - quorum is held by at least
    // quorum members.
    let quorum = half.len() / 2 + 1;
    acked[half.len() - quorum]
}

/// Highest index committed under `conf`: the minimum of each active half's
/// majority-stored index.
pub(crate) fn joint_committed_index(
    conf: &Config,
    matches: &HashMap<ServerAddress, Index>,
) -> Index {
    majority_committed(&conf.servers, matches).min(majority_committed(&conf.new_servers, matches))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::new(s)
    }

    fn addrs(names: &[&str]) -> Vec<ServerAddress> {
        names.iter().map(|n| addr(n)).collect()
    }

    #[test]
    fn majority_needs_strictly_more_than_half() {
        let half = addrs(&["a", "b", "c"]);
        let mut yes = HashSet::new();
        yes.insert(addr("a"));
        assert!(!majority_granted(&half, &yes));
        yes.insert(addr("b"));
        assert!(majority_granted(&half, &yes));
    }

    #[test]
    fn joint_vote_requires_both_halves() {
        let conf = Config::old_new(addrs(&["a", "b", "c"]), addrs(&["c", "d", "e"]));
        let yes: HashSet<_> = addrs(&["a", "b"]).into_iter().collect();
        // Majority of old, none of new.
        assert!(!joint_granted(&conf, &yes));
        let yes: HashSet<_> = addrs(&["a", "b", "c", "d"]).into_iter().collect();
        assert!(joint_granted(&conf, &yes));
    }

    #[test]
    fn committed_index_is_the_median_ack() {
        let conf = Config::normal(addrs(&["a", "b", "c"]));
        let mut matches = HashMap::new();
        matches.insert(addr("a"), Index::new(5));
        matches.insert(addr("b"), Index::new(3));
        matches.insert(addr("c"), Index::new(1));
        assert_eq!(joint_committed_index(&conf, &matches), Index::new(3));
    }

    #[test]
    fn joint_commit_is_the_minimum_of_both_halves() {
        let conf = Config::old_new(addrs(&["a", "b", "c"]), addrs(&["c", "d", "e"]));
        let mut matches = HashMap::new();
        matches.insert(addr("a"), Index::new(9));
        matches.insert(addr("b"), Index::new(9));
        matches.insert(addr("c"), Index::new(9));
        // New half has only c acked; its majority index is 0.
        assert_eq!(joint_committed_index(&conf, &matches), Index::new(0));
        matches.insert(addr("d"), Index::new(4));
        assert_eq!(joint_committed_index(&conf, &matches), Index::new(4));
    }

    #[test]
    fn unacked_members_count_as_zero() {
        let conf = Config::normal(addrs(&["a", "b", "c", "d", "e"]));
        let mut matches = HashMap::new();
        matches.insert(addr("a"), Index::new(7));
        matches.insert(addr("b"), Index::new(7));
        assert_eq!(joint_committed_index(&conf, &matches), Index::new(0));
        matches.insert(addr("c"), Index::new(2));
        assert_eq!(joint_committed_index(&conf, &matches), Index::new(2));
    }
}
