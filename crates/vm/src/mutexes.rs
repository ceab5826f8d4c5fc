//! The guest mutex registry
//!
//! Guest programs lock across dispatch iterations, so guest mutexes can't be
//! backed by a held Rust guard. Each is an owner/depth state machine behind
//! a condvar; misuse (unlocking from a non-owner, operating on a destroyed
//! handle) is a runtime error.

use std::{thread::ThreadId, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::{Error, ErrorKind, Ptr, Result, vm::SharedContext};

/// The maximum number of live guest mutexes
pub const MAX_MUTEXES: usize = 256;

/// How long a blocked lock sleeps between interrupt checks
const LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// One guest mutex
#[derive(Debug)]
struct GuestMutex {
    recursive: bool,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl GuestMutex {
    fn new(recursive: bool) -> Self {
        Self {
            recursive,
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the calling thread holds the mutex, re-checking the
    /// global interrupt while blocked
    fn lock(&self, handle: usize, ctx: &SharedContext) -> Result<()> {
        let caller = std::thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(caller);
                    state.depth = 1;
                    return Ok(());
                }
                Some(owner) if owner == caller => {
                    if self.recursive {
                        state.depth += 1;
                        return Ok(());
                    }
                    return crate::runtime_error!(
                        "Mutex {handle} is already held by the current thread"
                    );
                }
                Some(_) => {
                    if ctx.interrupt_requested() {
                        return Err(Error::new(ErrorKind::Interrupted));
                    }
                    self.cond.wait_for(&mut state, LOCK_POLL);
                }
            }
        }
    }

    fn unlock(&self, handle: usize) -> Result<()> {
        let caller = std::thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(caller) {
            return Err(Error::new(ErrorKind::MutexNotOwned(handle)));
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
        Ok(())
    }
}

/// The registry mapping integer handles to guest mutexes
///
/// Handles are allocated lowest-free-slot first; destroying the top slot
/// shrinks the logical count.
#[derive(Debug, Default)]
pub struct MutexRegistry {
    slots: Mutex<Vec<Option<Ptr<GuestMutex>>>>,
}

impl MutexRegistry {
    /// Makes an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mutex and returns its handle
    pub fn create(&self, recursive: bool) -> Result<usize> {
        let mut slots = self.slots.lock();
        let handle = match slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                if slots.len() >= MAX_MUTEXES {
                    return crate::runtime_error!("Too many mutexes (limit {MAX_MUTEXES})");
                }
                slots.push(None);
                slots.len() - 1
            }
        };
        slots[handle] = Some(Ptr::new(GuestMutex::new(recursive)));
        Ok(handle)
    }

    fn get(&self, handle: usize) -> Result<Ptr<GuestMutex>> {
        self.slots
            .lock()
            .get(handle)
            .and_then(Clone::clone)
            .ok_or_else(|| Error::new(ErrorKind::InvalidMutexHandle(handle)))
    }

    /// Blocks until the calling thread holds the mutex
    ///
    /// The registry lock is released before blocking, so creating and
    /// destroying other mutexes doesn't stall behind a contended lock. A
    /// global interrupt wakes blocked callers.
    pub fn lock(&self, handle: usize, ctx: &SharedContext) -> Result<()> {
        self.get(handle)?.lock(handle, ctx)
    }

    /// Releases the mutex, which the calling thread must hold
    pub fn unlock(&self, handle: usize) -> Result<()> {
        self.get(handle)?.unlock(handle)
    }

    /// Destroys the mutex
    ///
    /// Later operations on the handle fail until the slot is reused.
    pub fn destroy(&self, handle: usize) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(handle) {
            Some(slot @ Some(_)) => {
                *slot = None;
                while slots.last().is_some_and(Option::is_none) {
                    slots.pop();
                }
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::InvalidMutexHandle(handle))),
        }
    }

    /// The number of allocated slots, counting freed slots below a live one
    pub fn allocated(&self) -> usize {
        self.slots.lock().len()
    }
}
