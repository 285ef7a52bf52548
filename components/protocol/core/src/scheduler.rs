//  _____       ______   ____
// |_   _|     |  ____|/ ____|  Institute of Embedded Systems
//   | |  _ __ | |__  | (___    Zurich University of Applied Sciences
//   | | | '_ \|  __|  \___ \   8401 Winterthur, Switzerland
//  _| |_| | | | |____ ____) |
// |_____|_| |_|______|_____/
//
// Copyright 2025 Institute of Embedded Systems at Zurich University of Applied Sciences.
// All rights reserved.
// SPDX-License-Identifier: MIT

//! Cooperative, single-threaded task scheduler (spec §4.3).
//!
//! Tasks live in a [`RingQueue`], not a sorted heap: a due task is popped and
//! run, a not-yet-due task is "recycled" (moved front-to-back in O(1)) and
//! left for the next pass. This is what keeps the queue starvation-free
//! without ever sorting it — don't replace `recycle_front` with a binary heap,
//! the ordering it produces (insertion order among equally-due tasks) is load
//! bearing for fairness between a role's tasks.

use ring_queue::RingQueue;
use seel_api::TimeMs;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, trace};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, trace};

/// A monotonic millisecond clock the scheduler reads and, on beacon sync or
/// overflow, rewrites. Implementations are responsible for the atomicity of
/// `set_now_ms` (e.g. masking the timer interrupt on real hardware); the
/// scheduler only needs the write to be indivisible with respect to its own
/// reads.
pub trait Clock {
    fn now_ms(&self) -> TimeMs;
    fn set_now_ms(&mut self, new_ms: TimeMs);
}

pub type TaskId = u16;

#[derive(Debug, Clone, Copy)]
pub struct ScheduledTask<Task: Copy + Default> {
    pub id: TaskId,
    pub time_to_run: TimeMs,
    pub task: Task,
    pub is_user_task: bool,
}

impl<Task: Copy + Default> Default for ScheduledTask<Task> {
    fn default() -> Self {
        Self {
            id: 0,
            time_to_run: 0,
            task: Task::default(),
            is_user_task: false,
        }
    }
}

/// A cooperative delay queue of at most `CAP` tasks, driven by `C: Clock`.
pub struct Scheduler<C: Clock, Task: Copy + Default, const CAP: usize> {
    clock: C,
    queue: RingQueue<ScheduledTask<Task>, CAP>,
    next_task_id: TaskId,
    user_tasks_enabled: bool,
}

impl<C: Clock, Task: Copy + Default, const CAP: usize> Scheduler<C, Task, CAP> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            queue: RingQueue::new(),
            next_task_id: 0,
            user_tasks_enabled: false,
        }
    }

    pub fn now(&self) -> TimeMs {
        self.clock.now_ms()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn assign_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id = self.next_task_id.wrapping_add(1);
        id
    }

    /// Schedules `task` to run `delay` ms from now. On millisecond-counter
    /// overflow, rebases the clock to zero first (spec §4.3) so the sum
    /// cannot wrap.
    pub fn add_task(&mut self, task: Task, delay: TimeMs, is_user_task: bool) -> Option<TaskId> {
        let time_to_run = match self.now().checked_add(delay) {
            Some(t) => t,
            None => {
                self.zero_millis_timer();
                self.now() + delay
            }
        };
        let id = self.assign_task_id();
        let scheduled = ScheduledTask {
            id,
            time_to_run,
            task,
            is_user_task,
        };
        if self.queue.add(scheduled, false) {
            Some(id)
        } else {
            debug!("scheduler queue full, dropping task");
            None
        }
    }

    /// Runs exactly one iteration of the scheduler's main loop body: if the
    /// front task is due (and, if it's a user task, user tasks are enabled),
    /// pops and returns it for the caller to execute. Otherwise recycles the
    /// front to the back and returns `None`. A firmware main loop calls this
    /// in a tight `loop {}`; a simulator calls it once per advance of its own
    /// virtual clock.
    pub fn step(&mut self) -> Option<Task> {
        let now = self.now();
        let due = {
            let front = self.queue.front()?;
            front.time_to_run <= now && (!front.is_user_task || self.user_tasks_enabled)
        };
        if due {
            self.queue.pop_front().map(|t| t.task)
        } else {
            self.queue.recycle_front();
            None
        }
    }

    /// Runs `step` forever, invoking `exec` for every task it returns. Used
    /// by firmware targets; never returns.
    pub fn run(&mut self, mut exec: impl FnMut(&mut Self, Task)) -> ! {
        loop {
            if let Some(task) = self.step() {
                exec(self, task);
            }
        }
    }

    /// Earliest `time_to_run` among tasks currently eligible to run (system
    /// tasks always count; user tasks only count while enabled). `None` if
    /// nothing in the queue can ever become due as-is. Simulation harnesses
    /// use this to jump a virtual clock straight to the next event instead of
    /// busy-polling `step`.
    pub fn next_runnable_time(&self) -> Option<TimeMs> {
        self.queue
            .iter()
            .filter(|t| !t.is_user_task || self.user_tasks_enabled)
            .map(|t| t.time_to_run)
            .min()
    }

    pub fn set_user_task_enable(&mut self, enabled: bool) {
        self.user_tasks_enabled = enabled;
    }

    pub fn user_tasks_enabled(&self) -> bool {
        self.user_tasks_enabled
    }

    pub fn clear_tasks(&mut self) {
        self.queue.clear();
    }

    pub fn get_task_info(&self, id: TaskId) -> Option<&ScheduledTask<Task>> {
        self.queue.iter().find(|t| t.id == id)
    }

    /// Shifts every queued task's due time by `delta_ms`, clamping at 0 for
    /// anything that would otherwise go negative (past-due).
    pub fn offset_task_times(&mut self, delta_ms: i64) {
        for t in self.queue.iter_mut() {
            let shifted = t.time_to_run as i64 + delta_ms;
            t.time_to_run = shifted.max(0) as TimeMs;
        }
    }

    /// Zeroes the clock and rebases every queued task so relative due times
    /// are preserved (spec §4.3). Used on millisecond-counter overflow.
    pub fn zero_millis_timer(&mut self) {
        let now = self.now();
        self.offset_task_times(-(now as i64));
        self.clock.set_now_ms(0);
    }

    /// Sets the clock to `new_ms` and offsets every queued task by the same
    /// delta, so a task due in 5s from "now" is still due in 5s from the new
    /// clock value. This is how a beacon's `time_sync_ms` resynchronizes a
    /// whole node's schedule in one atomic step.
    pub fn adjust_time(&mut self, new_ms: TimeMs) {
        let delta = new_ms as i64 - self.now() as i64;
        self.offset_task_times(delta);
        self.clock.set_now_ms(new_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct TestClock(Cell<TimeMs>);
    impl Clock for TestClock {
        fn now_ms(&self) -> TimeMs {
            self.0.get()
        }
        fn set_now_ms(&mut self, new_ms: TimeMs) {
            self.0.set(new_ms);
        }
    }

    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
    enum TestTask {
        #[default]
        None,
        A,
        B,
    }

    type TestSched = Scheduler<TestClock, TestTask, 4>;

    #[test]
    fn recycles_not_yet_due_tasks_instead_of_running_them() {
        let mut s = TestSched::new(TestClock(Cell::new(0)));
        s.add_task(TestTask::A, 100, false);
        assert_eq!(s.step(), None, "not due yet");
        s.clock.set_now_ms(100);
        assert_eq!(s.step(), Some(TestTask::A));
    }

    #[test]
    fn due_tasks_run_in_fifo_order_among_themselves() {
        let mut s = TestSched::new(TestClock(Cell::new(0)));
        s.add_task(TestTask::A, 0, false);
        s.add_task(TestTask::B, 0, false);
        assert_eq!(s.step(), Some(TestTask::A));
        assert_eq!(s.step(), Some(TestTask::B));
    }

    #[test]
    fn disabled_user_task_is_recycled_not_executed() {
        let mut s = TestSched::new(TestClock(Cell::new(0)));
        s.add_task(TestTask::A, 0, true);
        assert_eq!(s.step(), None);
        s.set_user_task_enable(true);
        assert_eq!(s.step(), Some(TestTask::A));
    }

    #[test]
    fn adjust_time_shifts_relative_due_time() {
        let mut s = TestSched::new(TestClock(Cell::new(1_000)));
        s.add_task(TestTask::A, 500, false); // due at 1500
        s.adjust_time(10_000); // now jumps forward 9000
        assert_eq!(s.now(), 10_000);
        assert_eq!(s.get_task_info(0).unwrap().time_to_run, 10_500);
    }

    #[test]
    fn adjust_time_backward_clamps_at_zero() {
        let mut s = TestSched::new(TestClock(Cell::new(10_000)));
        s.add_task(TestTask::A, 100, false); // due at 10_100
        s.adjust_time(50); // huge backward jump
        assert_eq!(s.get_task_info(0).unwrap().time_to_run, 0);
    }

    #[test]
    fn zero_millis_timer_rebases_queue_to_new_zero() {
        let mut s = TestSched::new(TestClock(Cell::new(5_000)));
        s.add_task(TestTask::A, 1_000, false); // due at 6000, i.e. now+1000
        s.zero_millis_timer();
        assert_eq!(s.now(), 0);
        assert_eq!(s.get_task_info(0).unwrap().time_to_run, 1_000);
    }

    #[test]
    fn next_runnable_time_ignores_disabled_user_tasks() {
        let mut s = TestSched::new(TestClock(Cell::new(0)));
        s.add_task(TestTask::A, 500, true);
        s.add_task(TestTask::B, 900, false);
        assert_eq!(s.next_runnable_time(), Some(900));
        s.set_user_task_enable(true);
        assert_eq!(s.next_runnable_time(), Some(500));
    }

    #[test]
    fn clear_tasks_empties_queue() {
        let mut s = TestSched::new(TestClock(Cell::new(0)));
        s.add_task(TestTask::A, 0, false);
        s.clear_tasks();
        assert_eq!(s.step(), None);
        assert_eq!(s.next_runnable_time(), None);
    }
}
