//! Task manager: circular doubly-linked task ring with round-robin
//! selection.
//!
//! The head pointer marks the running task. Every mutation takes the
//! modify spinlock; the switch path only ever *tries* the lock, staying in
//! the current task when it loses the race. IDs are monotonically
//! increasing and never reused; id 0 is the "none" sentinel.

use alloc::boxed::Box;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::task::TaskContext;

/// One task in the ring.
struct Task {
    id: u64,
    /// Whether `block_task` may ever park this task.
    blockable: bool,
    blocked: bool,
    prev: *mut Task,
    next: *mut Task,
    context: TaskContext,
}

/// Ring state under the modify lock.
struct TaskRing {
    head: *mut Task,
    /// Monotonic creation counter; doubles as the id source.
    task_count: u64,
    /// Live tasks in the ring.
    ring_len: u64,
    /// Successful switches since boot.
    switches: u64,
}

// SAFETY: Raw node pointers are only ever touched under the modify lock.
unsafe impl Send for TaskRing {}

/// What the dispatcher needs to resume a different task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchTarget {
    pub cr3: u64,
    pub sp: u64,
}

/// The task manager.
pub struct TaskManager {
    ring: Mutex<TaskRing>,
}

impl TaskManager {
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(TaskRing {
                head: core::ptr::null_mut(),
                task_count: 0,
                ring_len: 0,
                switches: 0,
            }),
        }
    }

    /// Number of tasks ever created.
    pub fn task_count(&self) -> u64 {
        self.ring.lock().task_count
    }

    /// Live tasks in the ring.
    pub fn ring_len(&self) -> u64 {
        self.ring.lock().ring_len
    }

    /// Successful switches since boot.
    pub fn switches(&self) -> u64 {
        self.ring.lock().switches
    }

    /// Id of the task currently at the head (0 when the ring is empty).
    pub fn current_task_id(&self) -> u64 {
        let ring = self.ring.lock();
        if ring.head.is_null() {
            0
        } else {
            // SAFETY: Non-null head is a live ring node under the lock.
            unsafe { (*ring.head).id }
        }
    }

    /// Admit a task. Rejects contexts with any null field. Returns the new
    /// task's id.
    pub fn add_task(&self, context: TaskContext, blockable: bool) -> KernelResult<u64> {
        if !context.is_valid() {
            return Err(KernelError::InvalidParameter { name: "context" });
        }
        let mut ring = self.ring.lock();
        ring.task_count += 1;
        let id = ring.task_count;

        let node = Box::into_raw(Box::new(Task {
            id,
            blockable,
            blocked: false,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            context,
        }));

        // SAFETY: All ring pointers are live nodes owned by the ring; we
        // hold the modify lock.
        unsafe {
            if ring.head.is_null() {
                (*node).prev = node;
                (*node).next = node;
                ring.head = node;
            } else {
                // Splice as the tail (head->prev).
                let head = ring.head;
                let tail = (*head).prev;
                (*node).prev = tail;
                (*node).next = head;
                (*tail).next = node;
                (*head).prev = node;
            }
        }
        ring.ring_len += 1;
        Ok(id)
    }

    /// Find a node by id. Caller holds the lock.
    ///
    /// # Safety
    ///
    /// Must be called with the ring lock held.
    unsafe fn find(ring: &TaskRing, id: u64) -> Option<*mut Task> {
        if ring.head.is_null() || id == 0 {
            return None;
        }
        let mut cur = ring.head;
        loop {
            // SAFETY: Ring nodes are live while linked; lock held.
            unsafe {
                if (*cur).id == id {
                    return Some(cur);
                }
                cur = (*cur).next;
            }
            if cur == ring.head {
                return None;
            }
        }
    }

    /// Remove a task from the ring and hand its context back for address
    /// space teardown. Refuses to remove the last remaining task.
    pub fn remove_task(&self, id: u64) -> KernelResult<TaskContext> {
        let mut ring = self.ring.lock();
        if ring.ring_len <= 1 {
            return Err(KernelError::InvalidParameter { name: "id" });
        }
        // SAFETY: Lock held.
        let node = unsafe { Self::find(&ring, id) }.ok_or(KernelError::NotFound {
            resource: "task",
        })?;
        // SAFETY: node is live and the ring has at least two members, so
        // prev/next are distinct from node or wrap correctly.
        let context = unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            (*prev).next = next;
            (*next).prev = prev;
            if ring.head == node {
                ring.head = next;
            }
            let boxed = Box::from_raw(node);
            boxed.context
        };
        ring.ring_len -= 1;
        Ok(context)
    }

    /// Park a task; it is skipped by the round-robin until unblocked.
    pub fn block_task(&self, id: u64) -> KernelResult<()> {
        let ring = self.ring.lock();
        // SAFETY: Lock held.
        let node = unsafe { Self::find(&ring, id) }.ok_or(KernelError::NotFound {
            resource: "task",
        })?;
        // SAFETY: Live node, lock held.
        unsafe {
            if !(*node).blockable {
                return Err(KernelError::InvalidParameter { name: "id" });
            }
            (*node).blocked = true;
        }
        Ok(())
    }

    /// Resume a parked task.
    pub fn unblock_task(&self, id: u64) -> KernelResult<()> {
        let ring = self.ring.lock();
        // SAFETY: Lock held.
        let node = unsafe { Self::find(&ring, id) }.ok_or(KernelError::NotFound {
            resource: "task",
        })?;
        // SAFETY: Live node, lock held.
        unsafe {
            (*node).blocked = false;
        }
        Ok(())
    }

    /// Round-robin arbitration at a tick boundary.
    ///
    /// Non-blocking: returns `None` when the modify lock is contended
    /// (stay in the current task), when every other task is blocked, or
    /// when the ring has a single member. On success the outgoing task's
    /// saved stack pointer is recorded and the incoming task's `{cr3, sp}`
    /// is returned.
    pub fn task_switch(&self, outgoing_sp: u64) -> Option<SwitchTarget> {
        let mut ring = self.ring.try_lock()?;
        let head = ring.head;
        if head.is_null() {
            return None;
        }
        // SAFETY: Live nodes under the lock; the walk is bounded by the
        // ring length.
        unsafe {
            let mut candidate = (*head).next;
            while candidate != head && (*candidate).blocked {
                candidate = (*candidate).next;
            }
            if candidate == head {
                return None;
            }
            (*head).context.sp = outgoing_sp;
            ring.head = candidate;
            ring.switches += 1;
            Some(SwitchTarget {
                cr3: (*candidate).context.cr3,
                sp: (*candidate).context.sp,
            })
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tag: u64) -> TaskContext {
        TaskContext {
            cr3: 0x1000 * tag,
            ip: 0x2000 * tag,
            sp: 0x3000 * tag,
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let tm = TaskManager::new();
        let a = tm.add_task(ctx(1), true).unwrap();
        let b = tm.add_task(ctx(2), true).unwrap();
        assert_eq!((a, b), (1, 2));
        tm.remove_task(a).unwrap();
        let c = tm.add_task(ctx(3), true).unwrap();
        assert_eq!(c, 3, "removed id must not be reused");
    }

    #[test]
    fn test_null_contexts_rejected() {
        let tm = TaskManager::new();
        assert!(tm
            .add_task(
                TaskContext {
                    cr3: 0,
                    ip: 1,
                    sp: 1
                },
                true
            )
            .is_err());
    }

    #[test]
    fn test_last_task_cannot_be_removed() {
        let tm = TaskManager::new();
        let a = tm.add_task(ctx(1), true).unwrap();
        assert!(tm.remove_task(a).is_err());
        let b = tm.add_task(ctx(2), true).unwrap();
        assert!(tm.remove_task(a).is_ok());
        assert!(tm.remove_task(b).is_err(), "b is the last one now");
    }

    #[test]
    fn test_round_robin_cycles_through_ring() {
        let tm = TaskManager::new();
        let a = tm.add_task(ctx(1), true).unwrap();
        let b = tm.add_task(ctx(2), true).unwrap();
        let c = tm.add_task(ctx(3), true).unwrap();

        assert_eq!(tm.current_task_id(), a);
        tm.task_switch(0xAAA).unwrap();
        assert_eq!(tm.current_task_id(), b);
        tm.task_switch(0xBBB).unwrap();
        assert_eq!(tm.current_task_id(), c);
        tm.task_switch(0xCCC).unwrap();
        assert_eq!(tm.current_task_id(), a);
        // a's saved sp was recorded on the first switch away from it.
        let target = tm.task_switch(0xAAA2).unwrap();
        assert_eq!(tm.current_task_id(), b);
        assert_eq!(target.sp, 0xBBB, "b resumes from its recorded sp");
    }

    #[test]
    fn test_single_task_never_switches() {
        let tm = TaskManager::new();
        tm.add_task(ctx(1), true).unwrap();
        assert!(tm.task_switch(0x1).is_none());
        assert_eq!(tm.switches(), 0);
    }

    #[test]
    fn test_blocked_tasks_are_skipped() {
        let tm = TaskManager::new();
        let _a = tm.add_task(ctx(1), true).unwrap();
        let b = tm.add_task(ctx(2), true).unwrap();
        let c = tm.add_task(ctx(3), true).unwrap();
        tm.block_task(b).unwrap();

        tm.task_switch(0x10).unwrap();
        assert_eq!(tm.current_task_id(), c, "b skipped while blocked");
        tm.unblock_task(b).unwrap();
        tm.task_switch(0x20).unwrap();
        tm.task_switch(0x30).unwrap();
        assert_eq!(tm.current_task_id(), b, "b resumes after unblock");
    }

    #[test]
    fn test_all_others_blocked_stays_put() {
        let tm = TaskManager::new();
        let a = tm.add_task(ctx(1), true).unwrap();
        let b = tm.add_task(ctx(2), true).unwrap();
        tm.block_task(b).unwrap();
        assert!(tm.task_switch(0x1).is_none());
        assert_eq!(tm.current_task_id(), a);
    }

    #[test]
    fn test_unblockable_task_refuses_block() {
        let tm = TaskManager::new();
        let a = tm.add_task(ctx(1), false).unwrap();
        assert!(tm.block_task(a).is_err());
    }

    /// Scheduler fairness: over k*N arbitrations with N runnable tasks and
    /// no blocking, each task is selected within ±1 of k times.
    #[test]
    fn test_fairness_under_no_blocking() {
        let tm = TaskManager::new();
        let ids = [
            tm.add_task(ctx(1), true).unwrap(),
            tm.add_task(ctx(2), true).unwrap(),
            tm.add_task(ctx(3), true).unwrap(),
        ];
        let k = 333;
        let mut observed = [0u64; 3];
        for _ in 0..k * ids.len() {
            tm.task_switch(0xF00).unwrap();
            let cur = tm.current_task_id();
            observed[(cur - 1) as usize] += 1;
        }
        for counts in observed {
            assert!(
                (counts as i64 - k as i64).abs() <= 1,
                "unfair: {observed:?}"
            );
        }
        assert_eq!(tm.switches(), (k * ids.len()) as u64);
    }

    /// SC-3: three counting tasks, 1000 arbitrations; the counters differ
    /// by at most one and sum to 999 (the first arbitration is the initial
    /// self-switch away from the boot task... modeled by dropping one).
    #[test]
    fn test_three_counter_scenario() {
        let tm = TaskManager::new();
        for tag in 1..=3 {
            tm.add_task(ctx(tag), true).unwrap();
        }
        let mut counters = [0u64; 3];
        for round in 0..1000 {
            tm.task_switch(0x1000 + round).unwrap();
            if round == 0 {
                // The initial hand-off out of the boot context does not
                // count as a task increment.
                continue;
            }
            counters[(tm.current_task_id() - 1) as usize] += 1;
        }
        let (a, b, c) = (counters[0] as i64, counters[1] as i64, counters[2] as i64);
        assert!((a - b).abs() <= 1);
        assert!((b - c).abs() <= 1);
        assert_eq!(a + b + c, 999);
    }
}
