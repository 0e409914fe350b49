/*
Merging a freshly fetched window of recent commits into the known history.

Both lists are ordered newest first, children before parents. The window is
only usable when it connects to the known history: every parent of a window
commit must be either in the window or in the old list. When it does not, the
join returns None and the caller retries with a larger window or reloads.
*/

use crate::commit::{CommitIndex, GraphCommit};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::{debug, error};

/// Join the known commit list of one root with a recent window.
///
/// `old_refs` and `new_refs` are the commits pointed at by refs before and after the
/// refresh. Old commits reachable only from refs that vanished (and not from any
/// current ref or new commit) are dropped; everything else is `old ∪ new`.
pub fn join_single_root(
    old: &[GraphCommit],
    new: &[GraphCommit],
    old_refs: &HashSet<CommitIndex>,
    new_refs: &HashSet<CommitIndex>,
) -> Option<Vec<GraphCommit>> {
    let old_by_id = match index_by_id(old) {
        Some(map) => map,
        None => {
            error!(len = old.len(), "join.invariant.duplicate_in_old");
            return None;
        }
    };
    let new_by_id = match index_by_id(new) {
        Some(map) => map,
        None => {
            error!(len = new.len(), "join.invariant.duplicate_in_window");
            return None;
        }
    };

    // the window must connect to what we already know
    for commit in new {
        for parent in &commit.parents {
            if !new_by_id.contains_key(parent) && !old_by_id.contains_key(parent) {
                debug!(commit = commit.id, parent, "join.window_not_connected");
                return None;
            }
        }
    }
    for r in new_refs {
        if !new_by_id.contains_key(r) && !old_by_id.contains_key(r) {
            debug!(commit = r, "join.ref_outside_window");
            return None;
        }
    }

    let new_only: Vec<&GraphCommit> = new
        .iter()
        .filter(|c| !old_by_id.contains_key(&c.id))
        .collect();
    let new_only_ids: HashSet<CommitIndex> = new_only.iter().map(|c| c.id).collect();

    // a complete history never points into the future
    for commit in old {
        if let Some(parent) = commit.parents.iter().find(|p| new_only_ids.contains(p)) {
            error!(commit = commit.id, parent, "join.invariant.old_commit_has_new_parent");
            return None;
        }
    }

    let removed = removed_commits(old, &old_by_id, new, &new_by_id, old_refs, new_refs);
    let old_kept: Vec<&GraphCommit> = old.iter().filter(|c| !removed.contains(&c.id)).collect();

    let result = splice(&old_kept, &new_only);

    if !is_topologically_ordered(&result) {
        error!(len = result.len(), "join.invariant.result_not_topological");
        return None;
    }

    debug!(
        old = old.len(),
        window = new.len(),
        added = new_only.len(),
        removed = removed.len(),
        result = result.len(),
        "join.single_root.complete"
    );
    Some(result)
}

/// Interleave independent per-root lists by timestamp, newest first.
/// Each input keeps its own order; equal timestamps go to the earlier root.
pub fn join_multi_root(per_root: &[Vec<GraphCommit>]) -> Vec<GraphCommit> {
    let total: usize = per_root.iter().map(Vec::len).sum();
    let mut result = Vec::with_capacity(total);

    if per_root.len() == 1 {
        result.extend(per_root[0].iter().cloned());
        return result;
    }

    let mut heap = BinaryHeap::with_capacity(per_root.len());
    for (root_pos, commits) in per_root.iter().enumerate() {
        if let Some(first) = commits.first() {
            heap.push(HeadOfRoot {
                timestamp: first.timestamp,
                root_pos: Reverse(root_pos),
                offset: 0,
            });
        }
    }

    while let Some(head) = heap.pop() {
        let root_pos = head.root_pos.0;
        let commits = &per_root[root_pos];
        result.push(commits[head.offset].clone());

        let next = head.offset + 1;
        if let Some(commit) = commits.get(next) {
            heap.push(HeadOfRoot {
                timestamp: commit.timestamp,
                root_pos: Reverse(root_pos),
                offset: next,
            });
        }
    }

    result
}

/// Commits that nothing in the batch points at
pub fn heads(commits: &[GraphCommit]) -> HashSet<CommitIndex> {
    let referenced: HashSet<CommitIndex> = commits
        .iter()
        .flat_map(|c| c.parents.iter().copied())
        .collect();
    commits
        .iter()
        .map(|c| c.id)
        .filter(|id| !referenced.contains(id))
        .collect()
}

/// Every commit appears before all of its parents that are in the list
pub fn is_topologically_ordered(commits: &[GraphCommit]) -> bool {
    let position: HashMap<CommitIndex, usize> = commits
        .iter()
        .enumerate()
        .map(|(pos, c)| (c.id, pos))
        .collect();

    commits.iter().enumerate().all(|(pos, commit)| {
        commit
            .parents
            .iter()
            .all(|p| position.get(p).map_or(true, |&parent_pos| parent_pos > pos))
    })
}

#[derive(PartialEq, Eq)]
struct HeadOfRoot {
    timestamp: i64,
    root_pos: Reverse<usize>,
    offset: usize,
}

impl Ord for HeadOfRoot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.root_pos.cmp(&other.root_pos))
    }
}

impl PartialOrd for HeadOfRoot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn index_by_id(commits: &[GraphCommit]) -> Option<HashMap<CommitIndex, usize>> {
    let mut map = HashMap::with_capacity(commits.len());
    for (pos, commit) in commits.iter().enumerate() {
        if map.insert(commit.id, pos).is_some() {
            return None;
        }
    }
    Some(map)
}

/// Old commits reachable from vanished refs but not from current refs or new commits
fn removed_commits(
    old: &[GraphCommit],
    old_by_id: &HashMap<CommitIndex, usize>,
    new: &[GraphCommit],
    new_by_id: &HashMap<CommitIndex, usize>,
    old_refs: &HashSet<CommitIndex>,
    new_refs: &HashSet<CommitIndex>,
) -> HashSet<CommitIndex> {
    let vanished: Vec<CommitIndex> = old_refs
        .iter()
        .filter(|r| !new_refs.contains(r) && old_by_id.contains_key(r))
        .copied()
        .collect();
    if vanished.is_empty() {
        return HashSet::new();
    }

    let parents_of = |id: CommitIndex| -> &[CommitIndex] {
        if let Some(&pos) = new_by_id.get(&id) {
            &new[pos].parents
        } else if let Some(&pos) = old_by_id.get(&id) {
            &old[pos].parents
        } else {
            &[]
        }
    };

    let mut alive_starts: Vec<CommitIndex> = new_refs.iter().copied().collect();
    alive_starts.extend(new.iter().map(|c| c.id));
    let alive = reachable(alive_starts, &parents_of);
    let doomed = reachable(vanished, &parents_of);

    doomed
        .into_iter()
        .filter(|id| !alive.contains(id) && old_by_id.contains_key(id))
        .collect()
}

fn reachable<'a>(
    starts: Vec<CommitIndex>,
    parents_of: &impl Fn(CommitIndex) -> &'a [CommitIndex],
) -> HashSet<CommitIndex> {
    let mut seen: HashSet<CommitIndex> = HashSet::new();
    let mut queue: VecDeque<CommitIndex> = starts.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        queue.extend(parents_of(id).iter().copied());
    }
    seen
}

/// Merge new commits into the old list: newest first, but never after one of their parents
fn splice(old_kept: &[&GraphCommit], new_only: &[&GraphCommit]) -> Vec<GraphCommit> {
    // pending new children per old commit; an old commit can't be emitted while this is non-zero
    let mut blocked: HashMap<CommitIndex, usize> = HashMap::new();
    for commit in new_only {
        for parent in &commit.parents {
            *blocked.entry(*parent).or_default() += 1;
        }
    }

    let mut result = Vec::with_capacity(old_kept.len() + new_only.len());
    let (mut i, mut j) = (0, 0);

    while i < old_kept.len() || j < new_only.len() {
        let take_new = match (old_kept.get(i), new_only.get(j)) {
            (Some(o), Some(n)) => {
                blocked.get(&o.id).copied().unwrap_or(0) > 0 || n.timestamp >= o.timestamp
            }
            (None, Some(_)) => true,
            _ => false,
        };

        if take_new {
            let commit = new_only[j];
            for parent in &commit.parents {
                if let Some(count) = blocked.get_mut(parent) {
                    *count = count.saturating_sub(1);
                }
            }
            result.push(commit.clone());
            j += 1;
        } else {
            result.push(old_kept[i].clone());
            i += 1;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Linear history `from..to`, newest first, commit n has parent n-1 and timestamp n
    fn linear(from: u32, to: u32) -> Vec<GraphCommit> {
        (from..to)
            .rev()
            .map(|n| {
                let parents = if n == 0 { vec![] } else { vec![n - 1] };
                GraphCommit::new(n, parents, n as i64)
            })
            .collect()
    }

    fn ids(commits: &[GraphCommit]) -> Vec<CommitIndex> {
        commits.iter().map(|c| c.id).collect()
    }

    fn refs(ids: &[CommitIndex]) -> HashSet<CommitIndex> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_window_connected_to_known_history() {
        let old = linear(0, 100);
        let window = linear(95, 101);

        let joined = join_single_root(&old, &window, &refs(&[99]), &refs(&[100]))
            .expect("window is connected");

        assert_eq!(joined.len(), 101);
        assert_eq!(joined[0].id, 100);
        assert!(is_topologically_ordered(&joined));
    }

    #[test]
    fn test_gap_in_window_fails() {
        // old history was truncated at 40, commit 100 points at 50
        let old = linear(0, 40);
        let window = vec![
            GraphCommit::new(100, vec![50], 100),
            GraphCommit::new(99, vec![98], 99),
        ];

        assert!(join_single_root(&old, &window, &refs(&[]), &refs(&[])).is_none());
    }

    #[test]
    fn test_ref_pointing_outside_window_fails() {
        let old = linear(0, 10);
        let window = linear(8, 11);

        assert!(join_single_root(&old, &window, &refs(&[9]), &refs(&[10, 500])).is_none());
    }

    #[test]
    fn test_empty_window_keeps_old() {
        let old = linear(0, 10);
        let joined = join_single_root(&old, &[], &refs(&[9]), &refs(&[9])).expect("nothing to join");
        assert_eq!(joined, old);
    }

    #[test]
    fn test_new_branch_off_old_commit_is_interleaved() {
        // 0..10 known; new commit 20 branches off 5 but is newer than everything
        let old = linear(0, 10);
        let window = vec![
            GraphCommit::new(20, vec![5], 50),
            GraphCommit::new(9, vec![8], 9),
        ];

        let joined = join_single_root(&old, &window, &refs(&[9]), &refs(&[9, 20])).unwrap();
        assert_eq!(joined.len(), 11);
        assert_eq!(joined[0].id, 20);
        assert!(is_topologically_ordered(&joined));
    }

    #[test]
    fn test_old_timestamp_child_stays_before_parent() {
        // clock skew: the new commit claims to be older than its parent
        let old = linear(0, 5);
        let window = vec![GraphCommit::new(30, vec![4], -10)];

        let joined = join_single_root(&old, &window, &refs(&[4]), &refs(&[30])).unwrap();
        let pos = |id| joined.iter().position(|c| c.id == id).unwrap();
        assert!(pos(30) < pos(4));
        assert!(is_topologically_ordered(&joined));
    }

    #[test]
    fn test_deleted_branch_commits_are_dropped() {
        // main: 0-1-2, feature: 2-10-11 ; feature branch deleted
        let old = vec![
            GraphCommit::new(11, vec![10], 11),
            GraphCommit::new(10, vec![2], 10),
            GraphCommit::new(2, vec![1], 2),
            GraphCommit::new(1, vec![0], 1),
            GraphCommit::new(0, vec![], 0),
        ];
        let window = vec![GraphCommit::new(2, vec![1], 2)];

        let joined = join_single_root(&old, &window, &refs(&[2, 11]), &refs(&[2])).unwrap();
        assert_eq!(ids(&joined), vec![2, 1, 0]);
    }

    #[test]
    fn test_duplicate_in_old_is_treated_as_failure() {
        let mut old = linear(0, 3);
        old.push(GraphCommit::new(1, vec![0], 1));

        assert!(join_single_root(&old, &linear(2, 4), &refs(&[]), &refs(&[])).is_none());
    }

    #[test]
    fn test_old_commit_pointing_at_new_commit_is_failure() {
        let old = vec![GraphCommit::new(1, vec![7], 1)];
        let window = vec![GraphCommit::new(7, vec![], 0)];

        assert!(join_single_root(&old, &window, &refs(&[]), &refs(&[])).is_none());
    }

    #[test]
    fn test_multi_root_interleaves_by_time() {
        let a = vec![
            GraphCommit::new(1, vec![0], 30),
            GraphCommit::new(0, vec![], 10),
        ];
        let b = vec![
            GraphCommit::new(11, vec![10], 20),
            GraphCommit::new(10, vec![], 10),
        ];

        let joined = join_multi_root(&[a, b]);
        assert_eq!(ids(&joined), vec![1, 11, 0, 10]);
    }

    #[test]
    fn test_multi_root_empty_inputs() {
        assert!(join_multi_root(&[]).is_empty());
        assert_eq!(join_multi_root(&[vec![], linear(0, 3)]).len(), 3);
    }

    #[test]
    fn test_heads() {
        let commits = vec![
            GraphCommit::new(3, vec![1], 3),
            GraphCommit::new(2, vec![1], 2),
            GraphCommit::new(1, vec![0], 1),
            GraphCommit::new(0, vec![], 0),
        ];
        assert_eq!(heads(&commits), refs(&[3, 2]));
    }

    /// Random history: commit n picks 1-2 parents among earlier commits
    fn history_strategy() -> impl Strategy<Value = Vec<GraphCommit>> {
        (2usize..60)
            .prop_flat_map(|n| {
                (
                    Just(n),
                    prop::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>(), any::<bool>()), n),
                )
            })
            .prop_map(|(n, picks)| {
                let mut commits: Vec<GraphCommit> = (0..n)
                    .map(|i| {
                        let (a, b, merge) = &picks[i];
                        let mut parents = Vec::new();
                        if i > 0 {
                            parents.push(a.index(i) as u32);
                            let second = b.index(i) as u32;
                            if *merge && !parents.contains(&second) {
                                parents.push(second);
                            }
                        }
                        GraphCommit::new(i as u32, parents, i as i64)
                    })
                    .collect();
                commits.reverse();
                commits
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn join_of_connected_window_is_union(history in history_strategy(), split in any::<prop::sample::Index>(), overlap in 0usize..5) {
            // history is newest first; old = the oldest part, window = the newest part plus some overlap
            let cut = split.index(history.len());
            let old: Vec<GraphCommit> = history[cut..].to_vec();
            let window_end = (cut + overlap).min(history.len());
            let window: Vec<GraphCommit> = history[..window_end].to_vec();

            let joined = join_single_root(&old, &window, &HashSet::new(), &HashSet::new());
            prop_assert!(joined.is_some());
            let joined = joined.unwrap();

            let expected: HashSet<CommitIndex> = history.iter().map(|c| c.id).collect();
            let actual: HashSet<CommitIndex> = joined.iter().map(|c| c.id).collect();
            prop_assert_eq!(joined.len(), history.len());
            prop_assert_eq!(actual, expected);
            prop_assert!(is_topologically_ordered(&joined));
        }

        #[test]
        fn join_detects_missing_parent(history in history_strategy(), split in any::<prop::sample::Index>()) {
            let cut = split.index(history.len() - 1) + 1;
            let window: Vec<GraphCommit> = history[..cut].to_vec();
            let window_ids: HashSet<CommitIndex> = window.iter().map(|c| c.id).collect();
            // old lacks every parent the window needs from outside itself
            let old: Vec<GraphCommit> = Vec::new();
            let dangling = window
                .iter()
                .any(|c| c.parents.iter().any(|p| !window_ids.contains(p)));

            let joined = join_single_root(&old, &window, &HashSet::new(), &HashSet::new());
            prop_assert_eq!(joined.is_none(), dangling);
        }

        #[test]
        fn multi_root_keeps_every_commit(a in history_strategy(), b in history_strategy()) {
            let b: Vec<GraphCommit> = b
                .into_iter()
                .map(|c| GraphCommit::new(c.id + 1000, c.parents.iter().map(|p| p + 1000).collect(), c.timestamp))
                .collect();

            let joined = join_multi_root(&[a.clone(), b.clone()]);
            prop_assert_eq!(joined.len(), a.len() + b.len());
            prop_assert!(joined.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        }
    }
}
