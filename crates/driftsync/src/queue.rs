//! The task queue and the admission rule.
//!
//! Pure bookkeeping with an explicit `now`: the run loop owns the only
//! instance, and tests drive it without a runtime.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use driftsync_core::Collection;

use crate::environment::SchedulerEnvironment;
use crate::policy::SchedulerPolicy;
use crate::task::{SyncTask, SyncTaskSpec, TaskId, TaskState};

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    tasks: BTreeMap<TaskId, SyncTask>,
    next_id: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending task and return its id.
    pub fn insert(&mut self, spec: SyncTaskSpec, now: Instant) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.tasks.insert(id, SyncTask::new(id, spec, now));
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&SyncTask> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut SyncTask> {
        self.tasks.get_mut(&id)
    }

    pub fn running(&self) -> usize {
        self.with_state(TaskState::Running).count()
    }

    fn with_state(&self, state: TaskState) -> impl Iterator<Item = &SyncTask> {
        self.tasks.values().filter(move |t| t.state == state)
    }

    /// Move retrying tasks whose backoff gate has passed back to pending.
    pub fn promote_eligible(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        for task in self.tasks.values_mut() {
            if task.state == TaskState::FailedRetryable && task.is_eligible(now) {
                task.state = TaskState::Pending;
                task.next_eligible_at = None;
                promoted += 1;
            }
        }
        promoted
    }

    /// Tasks to start now, in start order.
    ///
    /// Pending and eligible tasks are ranked by priority tier, then enqueue
    /// order. A task is skipped while its collection is occupied by a running
    /// (or already chosen) task or while the environment defers it. Selection
    /// stops once `max_parallel_tasks` would be exceeded.
    pub fn admissible(
        &self,
        now: Instant,
        policy: &SchedulerPolicy,
        env: &SchedulerEnvironment,
    ) -> Vec<TaskId> {
        let mut slots = policy.max_parallel_tasks.saturating_sub(self.running());
        if slots == 0 {
            return Vec::new();
        }

        let mut busy: HashSet<&Collection> = self
            .with_state(TaskState::Running)
            .map(|t| &t.collection)
            .collect();

        let mut candidates: Vec<&SyncTask> = self
            .with_state(TaskState::Pending)
            .filter(|t| t.is_eligible(now))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let mut chosen = Vec::new();
        for task in candidates {
            if slots == 0 {
                break;
            }
            if busy.contains(&task.collection) {
                continue;
            }
            if policy.deferral(env, task.priority, task.large_payload).is_some() {
                continue;
            }
            busy.insert(&task.collection);
            chosen.push(task.id);
            slots -= 1;
        }
        chosen
    }

    /// Earliest instant at which something time-driven is due: a backoff
    /// gate opening or a finished task expiring.
    pub fn next_wakeup(&self, retain: Duration) -> Option<Instant> {
        self.tasks
            .values()
            .filter_map(|t| match t.state {
                TaskState::FailedRetryable => t.next_eligible_at,
                _ => t.finished_at.map(|at| at + retain),
            })
            .min()
    }

    /// Drop terminal tasks that finished more than `retain` ago.
    pub fn collect_garbage(&mut self, now: Instant, retain: Duration) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| match t.finished_at {
            Some(at) if t.is_terminal() => at + retain > now,
            _ => true,
        });
        before - self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{NetworkClass, PowerState};
    use driftsync_core::{Direction, Priority};

    fn spec(name: &str) -> SyncTaskSpec {
        SyncTaskSpec::new(Collection::new(name).unwrap(), Direction::Pull)
    }

    fn policy(parallel: usize) -> SchedulerPolicy {
        SchedulerPolicy::default().with_max_parallel_tasks(parallel)
    }

    #[test]
    fn test_priority_then_enqueue_order() {
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let a = q.insert(spec("a"), now);
        let b = q.insert(spec("b").with_priority(Priority::Interactive), now);
        let c = q.insert(spec("c").with_priority(Priority::Background), now);
        let d = q.insert(spec("d"), now);

        let order = q.admissible(now, &policy(4), &SchedulerEnvironment::default());
        assert_eq!(order, vec![b, a, d, c]);
    }

    #[test]
    fn test_parallel_limit_counts_running() {
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let a = q.insert(spec("a"), now);
        q.insert(spec("b"), now);
        let c = q.insert(spec("c"), now);
        q.get_mut(a).unwrap().state = TaskState::Running;

        let order = q.admissible(now, &policy(2), &SchedulerEnvironment::default());
        assert_eq!(order.len(), 1);
        assert_ne!(order[0], c);
    }

    #[test]
    fn test_one_task_per_collection() {
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let first = q.insert(spec("diaries"), now);
        let second = q.insert(spec("diaries").with_priority(Priority::Background), now);
        let other = q.insert(spec("photos"), now);

        let order = q.admissible(now, &policy(4), &SchedulerEnvironment::default());
        assert_eq!(order, vec![first, other]);

        q.get_mut(first).unwrap().state = TaskState::Running;
        let order = q.admissible(now, &policy(4), &SchedulerEnvironment::default());
        assert_eq!(order, vec![other]);

        q.get_mut(first).unwrap().finish(TaskState::Succeeded, now);
        let order = q.admissible(now, &policy(4), &SchedulerEnvironment::default());
        assert_eq!(order, vec![second, other]);
    }

    #[test]
    fn test_environment_deferral() {
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let bg = q.insert(spec("a").with_priority(Priority::Background), now);
        let ui = q.insert(spec("b").with_priority(Priority::Interactive), now);
        let big = q.insert(
            spec("c").with_priority(Priority::Interactive).with_large_payload(true),
            now,
        );

        let offline = SchedulerEnvironment::offline();
        assert!(q.admissible(now, &policy(4), &offline).is_empty());

        let saver = SchedulerEnvironment::new(NetworkClass::Unmetered, PowerState::Saver);
        assert_eq!(q.admissible(now, &policy(4), &saver), vec![ui, big]);

        let metered = SchedulerEnvironment::new(NetworkClass::Metered, PowerState::Normal);
        assert_eq!(q.admissible(now, &policy(4), &metered), vec![ui]);

        assert_eq!(
            q.admissible(now, &policy(4), &SchedulerEnvironment::default()),
            vec![ui, big, bg]
        );
    }

    #[test]
    fn test_backoff_gate_and_promotion() {
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let id = q.insert(spec("a"), now);
        {
            let task = q.get_mut(id).unwrap();
            task.state = TaskState::FailedRetryable;
            task.next_eligible_at = Some(now + Duration::from_secs(2));
        }

        assert_eq!(q.promote_eligible(now), 0);
        assert!(q.admissible(now, &policy(1), &SchedulerEnvironment::default()).is_empty());
        assert_eq!(
            q.next_wakeup(Duration::from_secs(60)),
            Some(now + Duration::from_secs(2))
        );

        let later = now + Duration::from_secs(2);
        assert_eq!(q.promote_eligible(later), 1);
        assert_eq!(q.get(id).unwrap().state, TaskState::Pending);
        assert_eq!(
            q.admissible(later, &policy(1), &SchedulerEnvironment::default()),
            vec![id]
        );
    }

    #[test]
    fn test_garbage_collection() {
        let now = Instant::now();
        let retain = Duration::from_secs(60);
        let mut q = TaskQueue::new();
        let done = q.insert(spec("a"), now);
        let waiting = q.insert(spec("b"), now);
        q.get_mut(done).unwrap().finish(TaskState::Succeeded, now);

        assert_eq!(q.next_wakeup(retain), Some(now + retain));
        assert_eq!(q.collect_garbage(now + Duration::from_secs(59), retain), 0);
        assert_eq!(q.collect_garbage(now + retain, retain), 1);
        assert!(q.get(done).is_none());
        assert!(q.get(waiting).is_some());
        assert_eq!(q.len(), 1);
    }
}
