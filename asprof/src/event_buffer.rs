//! Multi-producer single-consumer event buffer.
//!
//! Producers run inside signal handlers: `publish` allocates a node from the
//! arena and pushes it onto an atomic singly-linked list with CAS. The single
//! consumer detaches the whole list at once, reverses it to restore arrival
//! order, and drains it node by node. `clear` may only run when no producers
//! or consumers are active.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::arena::Arena;
use crate::event::{Event, EventType};

const EVENT_CHUNK: usize = 1024 * 1024;

#[repr(C)]
struct Node {
    next: *mut Node,
    event_type: EventType,
    tid: i32,
    call_trace_id: u32,
    event: Event,
}

/// One drained record.
#[derive(Debug, Clone, Copy)]
pub struct BufferedEvent {
    pub event_type: EventType,
    pub tid: i32,
    pub call_trace_id: u32,
    pub event: Event,
}

pub struct EventBuffer {
    allocator: Arena,
    producer_head: AtomicPtr<Node>,
    consumer_head: AtomicPtr<Node>,
}

unsafe impl Send for EventBuffer {}
unsafe impl Sync for EventBuffer {}

impl EventBuffer {
    pub fn new() -> Self {
        EventBuffer {
            allocator: Arena::new(EVENT_CHUNK),
            producer_head: AtomicPtr::new(ptr::null_mut()),
            consumer_head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Appends one event. Returns false when the arena is exhausted, in
    /// which case the event is dropped. Async-signal-safe.
    pub fn publish(&self, event_type: EventType, event: Event, tid: i32, call_trace_id: u32) -> bool {
        let node = self.allocator.alloc(std::mem::size_of::<Node>()) as *mut Node;
        if node.is_null() {
            return false;
        }
        unsafe {
            (*node).event_type = event_type;
            (*node).tid = tid;
            (*node).call_trace_id = call_trace_id;
            (*node).event = event;

            let mut head = self.producer_head.load(Ordering::Relaxed);
            loop {
                (*node).next = head;
                match self.producer_head.compare_exchange_weak(
                    head,
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(actual) => head = actual,
                }
            }
        }
    }

    /// Takes the next event in publish order, or `None` when the buffer is
    /// empty. Must only be called from one consumer thread at a time.
    pub fn poll(&self) -> Option<BufferedEvent> {
        let mut head = self.consumer_head.load(Ordering::Relaxed);
        if head.is_null() {
            // Detach everything published so far and reverse it so the
            // oldest event comes out first.
            let mut detached = self.producer_head.swap(ptr::null_mut(), Ordering::Acquire);
            let mut reversed: *mut Node = ptr::null_mut();
            while !detached.is_null() {
                unsafe {
                    let next = (*detached).next;
                    (*detached).next = reversed;
                    reversed = detached;
                    detached = next;
                }
            }
            head = reversed;
        }
        if head.is_null() {
            return None;
        }
        unsafe {
            self.consumer_head.store((*head).next, Ordering::Relaxed);
            Some(BufferedEvent {
                event_type: (*head).event_type,
                tid: (*head).tid,
                call_trace_id: (*head).call_trace_id,
                event: (*head).event,
            })
        }
    }

    pub fn clear(&self) {
        self.producer_head.store(ptr::null_mut(), Ordering::Relaxed);
        self.consumer_head.store(ptr::null_mut(), Ordering::Relaxed);
        self.allocator.clear();
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ExecutionEvent;
    use crate::os::ThreadState;
    use std::sync::Arc;

    fn execution(start_time: u64) -> Event {
        Event::Execution(ExecutionEvent {
            start_time,
            thread_state: ThreadState::Running,
        })
    }

    #[test]
    fn events_drain_in_publish_order() {
        let buffer = EventBuffer::new();
        for i in 0..10 {
            assert!(buffer.publish(EventType::ExecutionSample, execution(i), 1, 100 + i as u32));
        }
        for i in 0..10 {
            let event = buffer.poll().unwrap();
            assert_eq!(event.call_trace_id, 100 + i);
            assert_eq!(event.event.start_time(), i as u64);
        }
        assert!(buffer.poll().is_none());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let buffer = Arc::new(EventBuffer::new());
        const THREADS: usize = 4;
        const PER_THREAD: usize = 1000;

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let buffer = buffer.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    assert!(buffer.publish(
                        EventType::ExecutionSample,
                        execution(i as u64),
                        t as i32,
                        0,
                    ));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut count = 0;
        while buffer.poll().is_some() {
            count += 1;
        }
        assert_eq!(count, THREADS * PER_THREAD);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let buffer = EventBuffer::new();
        buffer.publish(EventType::ExecutionSample, execution(1), 1, 1);
        buffer.clear();
        assert!(buffer.poll().is_none());
    }
}
