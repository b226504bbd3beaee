//! Virtual clock and event scheduler
//!
//! The CPU core runs in slices. `downcount` in the guest state holds the
//! cycles left in the current slice; `advance` accounts for the elapsed
//! part, fires due events and starts the next slice.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::cpu::GuestState;

/// Default slice length in CPU cycles
pub const DEFAULT_SLICE_LENGTH: i32 = 20_000;

/// Scheduler interface consumed by the CPU cores
pub trait Scheduler {
    /// Account for the finished slice, fire due events, start a new slice
    fn advance(&mut self, state: &mut GuestState);

    /// The guest is spinning in an idle loop: skip to the end of the slice
    fn idle(&mut self, state: &mut GuestState);

    /// Total cycles executed so far, including the running slice
    fn ticks(&self, state: &GuestState) -> u64;

    /// Whether a requested stop point has been reached
    fn deadline_reached(&self, _state: &GuestState) -> bool {
        false
    }
}

/// Timed callback; receives how many cycles late it fired
pub type EventCallback = fn(&mut GuestState, u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Event {
    time: u64,
    order: u64,
    callback: usize,
}

/// Slice-based scheduler with a priority queue of timed events
pub struct CoreTiming {
    slice_length: i32,
    /// Length of the slice currently running
    current_slice: i32,
    /// Cycles executed before the current slice started
    global_timer: u64,
    idled_cycles: u64,
    deadline: Option<u64>,
    events: BinaryHeap<Reverse<Event>>,
    callbacks: Vec<(&'static str, EventCallback)>,
    next_order: u64,
}

impl Default for CoreTiming {
    fn default() -> Self {
        Self::new(DEFAULT_SLICE_LENGTH)
    }
}

impl CoreTiming {
    pub fn new(slice_length: i32) -> Self {
        CoreTiming {
            slice_length: slice_length.max(1),
            current_slice: 0,
            global_timer: 0,
            idled_cycles: 0,
            deadline: None,
            events: BinaryHeap::new(),
            callbacks: Vec::new(),
            next_order: 0,
        }
    }

    /// Register an event type; returns its handle for `schedule`
    pub fn register_event(&mut self, name: &'static str, callback: EventCallback) -> usize {
        self.callbacks.push((name, callback));
        self.callbacks.len() - 1
    }

    /// Fire event `handle` `cycles_into_future` cycles after now
    pub fn schedule(&mut self, state: &GuestState, handle: usize, cycles_into_future: u64) {
        let time = self.ticks(state) + cycles_into_future;
        let order = self.next_order;
        self.next_order += 1;
        self.events.push(Reverse(Event { time, order, callback: handle }));
    }

    /// Stop `run` once this many total cycles have elapsed
    pub fn set_deadline(&mut self, ticks: Option<u64>) {
        self.deadline = ticks;
    }

    pub fn idled_cycles(&self) -> u64 {
        self.idled_cycles
    }

    pub fn slice_length(&self) -> i32 {
        self.slice_length
    }

    pub fn reset(&mut self) {
        self.current_slice = 0;
        self.global_timer = 0;
        self.idled_cycles = 0;
        self.deadline = None;
        self.events.clear();
        self.next_order = 0;
    }

    /// Restore the clock from a save-state
    pub fn restore(&mut self, ticks: u64, state: &mut GuestState) {
        self.reset();
        self.global_timer = ticks;
        state.downcount = 0;
    }

    fn next_slice_length(&self) -> i32 {
        let mut length = self.slice_length as u64;
        if let Some(Reverse(next)) = self.events.peek() {
            length = length.min(next.time.saturating_sub(self.global_timer).max(1));
        }
        if let Some(deadline) = self.deadline {
            length = length.min(deadline.saturating_sub(self.global_timer).max(1));
        }
        length as i32
    }
}

impl Scheduler for CoreTiming {
    fn advance(&mut self, state: &mut GuestState) {
        let executed = self.current_slice as i64 - state.downcount as i64;
        self.global_timer = self.global_timer.wrapping_add(executed.max(0) as u64);

        while let Some(Reverse(event)) = self.events.peek().copied() {
            if event.time > self.global_timer {
                break;
            }
            self.events.pop();
            if let Some(&(name, callback)) = self.callbacks.get(event.callback) {
                log::trace!("[CoreTiming] event {} at {}", name, self.global_timer);
                callback(state, self.global_timer - event.time);
            }
        }

        self.current_slice = self.next_slice_length();
        state.downcount = self.current_slice;
    }

    fn idle(&mut self, state: &mut GuestState) {
        // an overrun slice keeps its negative downcount so no ticks are lost
        if state.downcount > 0 {
            self.idled_cycles += state.downcount as u64;
            state.downcount = 0;
        }
    }

    fn ticks(&self, state: &GuestState) -> u64 {
        let executed = self.current_slice as i64 - state.downcount as i64;
        self.global_timer.wrapping_add(executed.max(0) as u64)
    }

    fn deadline_reached(&self, state: &GuestState) -> bool {
        match self.deadline {
            Some(deadline) => self.ticks(state) >= deadline,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::EXCEPTION_EXTERNAL_INT;

    fn raise_external(state: &mut GuestState, _late: u64) {
        state.exceptions |= EXCEPTION_EXTERNAL_INT;
    }

    #[test]
    fn test_slices_account_cycles() {
        let mut t = CoreTiming::new(100);
        let mut s = GuestState::new();
        t.advance(&mut s);
        assert_eq!(s.downcount, 100);
        s.downcount -= 30;
        assert_eq!(t.ticks(&s), 30);
        s.downcount = -5;
        t.advance(&mut s);
        assert_eq!(t.ticks(&s), 105);
        assert_eq!(s.downcount, 100);
    }

    #[test]
    fn test_event_fires_and_shortens_slice() {
        let mut t = CoreTiming::new(1000);
        let mut s = GuestState::new();
        let ev = t.register_event("irq", raise_external);
        t.schedule(&s, ev, 250);
        t.advance(&mut s);
        assert_eq!(s.downcount, 250);
        s.downcount = 0;
        t.advance(&mut s);
        assert_eq!(s.exceptions & EXCEPTION_EXTERNAL_INT, EXCEPTION_EXTERNAL_INT);
        assert_eq!(s.downcount, 1000);
    }

    #[test]
    fn test_idle_skips_rest_of_slice() {
        let mut t = CoreTiming::new(500);
        let mut s = GuestState::new();
        t.advance(&mut s);
        s.downcount -= 100;
        t.idle(&mut s);
        assert_eq!(s.downcount, 0);
        assert_eq!(t.idled_cycles(), 400);
        assert_eq!(t.ticks(&s), 500);
    }

    #[test]
    fn test_idle_after_overrun_keeps_ticks() {
        let mut t = CoreTiming::new(500);
        let mut s = GuestState::new();
        t.advance(&mut s);
        s.downcount -= 520;
        t.idle(&mut s);
        assert_eq!(s.downcount, -20);
        assert_eq!(t.idled_cycles(), 0);
        assert_eq!(t.ticks(&s), 520);
    }

    #[test]
    fn test_deadline() {
        let mut t = CoreTiming::new(1000);
        let mut s = GuestState::new();
        t.set_deadline(Some(300));
        t.advance(&mut s);
        assert_eq!(s.downcount, 300);
        assert!(!t.deadline_reached(&s));
        s.downcount = 0;
        assert!(t.deadline_reached(&s));
    }
}
