//! Shared FIFO of pending fuzz tasks.

use std::collections::VecDeque;
use std::sync::Mutex;

/// One unit of work for a worker: fuzz `target` inside package `pkg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    pub pkg: String,
    pub target: String,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pkg, self.target)
    }
}

/// Lock-protected FIFO shared by the worker pool. `dequeue` never blocks;
/// workers exit once the queue is drained.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push_back(task);
    }

    pub fn dequeue(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        let tasks = self.tasks.lock().unwrap();
        tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn task(n: usize) -> Task {
        Task {
            pkg: "parser".to_string(),
            target: format!("Fuzz{}", n),
        }
    }

    #[test]
    fn fifo_order() {
        let q = TaskQueue::new();
        q.enqueue(task(0));
        q.enqueue(task(1));
        q.enqueue(task(2));

        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue(), Some(task(0)));
        assert_eq!(q.dequeue(), Some(task(1)));
        assert_eq!(q.dequeue(), Some(task(2)));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn dequeue_on_empty_returns_none() {
        let q = TaskQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn concurrent_dequeue_is_exactly_once() {
        let q = Arc::new(TaskQueue::new());
        let total = 1000;
        for i in 0..total {
            q.enqueue(task(i));
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(t) = q.dequeue() {
                    got.push(t);
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        let mut count = 0;
        for h in handles {
            for t in h.join().unwrap() {
                assert!(seen.insert(t), "task dequeued twice");
                count += 1;
            }
        }
        assert_eq!(count, total);
        assert!(q.is_empty());
    }
}
