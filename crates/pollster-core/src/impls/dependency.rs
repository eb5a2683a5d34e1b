//! Data dependency index for the in-memory store.
//!
//! - Forward edges: task -> data it still waits for
//! - Reverse edges: data -> tasks waiting for it
//! - Invariant: both maps describe the same edge set

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::{DataId, TaskId};

#[derive(Debug, Default)]
pub struct DependencyIndex {
    /// task -> data it waits for
    edges: HashMap<TaskId, HashSet<DataId>>,

    /// data -> tasks waiting for it
    reverse_edges: HashMap<DataId, HashSet<TaskId>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` waits for `data`.
    pub fn add_dependency(&mut self, task: TaskId, data: DataId) {
        self.edges.entry(task).or_default().insert(data);
        self.reverse_edges.entry(data).or_default().insert(task);
    }

    /// `data` became available. Returns the tasks that waited for it, each
    /// paired with whether it now waits for nothing.
    pub fn resolve(&mut self, data: DataId) -> Vec<(TaskId, bool)> {
        let Some(waiting) = self.reverse_edges.remove(&data) else {
            return Vec::new();
        };

        let mut resolved = Vec::with_capacity(waiting.len());
        for task in waiting {
            let unblocked = match self.edges.entry(task) {
                Entry::Occupied(mut e) => {
                    e.get_mut().remove(&data);
                    if e.get().is_empty() {
                        e.remove_entry();
                        true
                    } else {
                        false
                    }
                }
                Entry::Vacant(_) => true,
            };
            resolved.push((task, unblocked));
        }
        resolved
    }

    /// `data` will never exist. Every task waiting for it leaves the index
    /// and is returned.
    pub fn abort(&mut self, data: DataId) -> Vec<TaskId> {
        let Some(waiting) = self.reverse_edges.remove(&data) else {
            return Vec::new();
        };

        for task in &waiting {
            for other in self.edges.remove(task).unwrap_or_default() {
                if let Entry::Occupied(mut e) = self.reverse_edges.entry(other) {
                    e.get_mut().remove(task);
                    if e.get().is_empty() {
                        e.remove_entry();
                    }
                }
            }
        }
        waiting.into_iter().collect()
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn waiting_for(&self, data: DataId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&data)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_unblocks_when_its_last_dependency_resolves() {
        let mut index = DependencyIndex::new();
        let task = TaskId::random();
        let (a, b) = (DataId::random(), DataId::random());

        index.add_dependency(task, a);
        index.add_dependency(task, b);
        assert_eq!(index.waiting_for(a), vec![task]);

        assert_eq!(index.resolve(a), vec![(task, false)]);
        assert!(index.has_dependencies(task));

        assert_eq!(index.resolve(b), vec![(task, true)]);
        assert!(!index.has_dependencies(task));
    }

    #[test]
    fn aborted_data_drops_its_waiters_entirely() {
        let mut index = DependencyIndex::new();
        let (aborted, other) = (DataId::random(), DataId::random());
        let (t1, t2) = (TaskId::random(), TaskId::random());
        index.add_dependency(t1, aborted);
        index.add_dependency(t1, other);
        index.add_dependency(t2, other);

        assert_eq!(index.abort(aborted), vec![t1]);
        assert!(!index.has_dependencies(t1));
        assert_eq!(index.waiting_for(other), vec![t2]);
        assert_eq!(index.resolve(other), vec![(t2, true)]);
        assert!(index.abort(aborted).is_empty());
    }

    #[test]
    fn one_result_can_unblock_many_tasks() {
        let mut index = DependencyIndex::new();
        let data = DataId::random();
        let (t1, t2) = (TaskId::random(), TaskId::random());
        index.add_dependency(t1, data);
        index.add_dependency(t2, data);

        let mut unblocked: Vec<TaskId> = index
            .resolve(data)
            .into_iter()
            .filter_map(|(task, done)| done.then_some(task))
            .collect();
        unblocked.sort();

        let mut expected = vec![t1, t2];
        expected.sort();
        assert_eq!(unblocked, expected);
        assert!(index.resolve(data).is_empty());
    }
}
