//! The worker thread pool
//!
//! Spawning hands a job to a pooled OS thread running a private `Vm` that
//! shares the program context. Each worker slot has a mailbox delivering a
//! result value and a success status, each consumable exactly once; the
//! slot is recycled only after both have been taken. Joins use bounded
//! waits so a global interrupt is never missed.

use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::{
    Error, ErrorKind, Ptr, Result, Value, Vm,
    value::ClosureEnv,
    vm::SharedContext,
};

/// How long a blocked join sleeps between interrupt checks
const JOIN_POLL: Duration = Duration::from_millis(100);

/// A unit of work for a worker thread
#[derive(Clone, Debug)]
pub enum Job {
    /// Runs bytecode from an entry offset with deep-copied arguments
    Bytecode {
        /// The routine's entry offset
        entry: usize,
        /// Arguments, already deep-copied by the spawner
        args: Vec<Value>,
        /// The closure environment, retained so by-reference captures alias
        env: Option<Ptr<ClosureEnv>>,
    },
    /// Calls a named builtin
    Builtin {
        /// The builtin's name
        name: String,
        /// Arguments, already deep-copied by the spawner
        args: Vec<Value>,
    },
    /// Calls a host callback slot
    Host {
        /// The host slot
        id: u8,
        /// Arguments, already deep-copied by the spawner
        args: Vec<Value>,
    },
}

#[derive(Debug, Default)]
struct MailboxState {
    outcome: Option<std::result::Result<Value, Error>>,
    finished: bool,
    result_taken: bool,
    status_taken: bool,
    paused: bool,
    cancelled: bool,
}

/// A worker slot's delivery channel
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    cond: Condvar,
}

impl Mailbox {
    fn deliver(&self, outcome: std::result::Result<Value, Error>) {
        let mut state = self.state.lock();
        state.outcome = Some(outcome);
        state.finished = true;
        self.cond.notify_all();
    }

    /// Waits for completion, re-checking the global interrupt while blocked
    fn wait_finished(&self, ctx: &SharedContext) -> Result<parking_lot::MutexGuard<'_, MailboxState>> {
        let mut state = self.state.lock();
        while !state.finished {
            if ctx.interrupt_requested() {
                return Err(Error::new(ErrorKind::Interrupted));
            }
            self.cond.wait_for(&mut state, JOIN_POLL);
        }
        Ok(state)
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.paused = false;
        self.cond.notify_all();
    }

    pub(crate) fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub(crate) fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        self.cond.notify_all();
    }

    /// True once the worker has been asked to stop
    pub(crate) fn cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Blocks while the worker is paused; returns false when cancelled
    pub(crate) fn wait_while_paused(&self, ctx: &SharedContext) -> bool {
        let mut state = self.state.lock();
        while state.paused && !state.cancelled {
            if ctx.interrupt_requested() {
                return false;
            }
            self.cond.wait_for(&mut state, JOIN_POLL);
        }
        !state.cancelled
    }
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Option<Ptr<Mailbox>>>,
    queue: VecDeque<(usize, Job)>,
    workers: usize,
    shutdown: bool,
}

/// The registry mapping thread handles to worker slots
#[derive(Debug)]
pub struct ThreadRegistry {
    state: Mutex<PoolState>,
    queue_cond: Condvar,
    max_workers: usize,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ThreadRegistry {
    /// Makes a registry with a worker cap
    pub fn new(max_workers: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            queue_cond: Condvar::new(),
            max_workers: max_workers.max(1),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Queues a job and returns its thread handle
    ///
    /// The lowest free slot is used; a new worker is started unless the
    /// pool is at its cap, in which case the job waits in the queue.
    pub fn spawn(&self, ctx: &Ptr<SharedContext>, job: Job) -> Result<usize> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(Error::new(ErrorKind::PoolShutdown));
        }

        let id = match state.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                state.slots.push(None);
                state.slots.len() - 1
            }
        };
        state.slots[id] = Some(Ptr::new(Mailbox::default()));
        state.queue.push_back((id, job));

        if state.workers < self.max_workers {
            state.workers += 1;
            let ctx = ctx.clone();
            let handle = std::thread::spawn(move || worker_loop(ctx));
            self.handles.lock().push(handle);
        }

        drop(state);
        self.queue_cond.notify_one();
        Ok(id)
    }

    fn mailbox(&self, id: usize) -> Result<Ptr<Mailbox>> {
        self.state
            .lock()
            .slots
            .get(id)
            .and_then(Clone::clone)
            .ok_or_else(|| Error::new(ErrorKind::InvalidThreadHandle(id)))
    }

    /// Waits for a worker and consumes its success status
    pub fn take_status(&self, id: usize, ctx: &SharedContext) -> Result<bool> {
        let mailbox = self.mailbox(id)?;
        let success = {
            let mut state = mailbox.wait_finished(ctx)?;
            if state.status_taken {
                return Err(Error::new(ErrorKind::ResultAlreadyTaken(id)));
            }
            state.status_taken = true;
            matches!(state.outcome, Some(Ok(_)))
        };
        self.maybe_recycle(id, &mailbox);
        Ok(success)
    }

    /// Waits for a worker and consumes its result value
    ///
    /// A worker that failed yields its error here.
    pub fn take_result(&self, id: usize, ctx: &SharedContext) -> Result<Value> {
        let mailbox = self.mailbox(id)?;
        let outcome = {
            let mut state = mailbox.wait_finished(ctx)?;
            if state.result_taken {
                return Err(Error::new(ErrorKind::ResultAlreadyTaken(id)));
            }
            state.result_taken = true;
            state.outcome.clone()
        };
        self.maybe_recycle(id, &mailbox);
        match outcome {
            Some(outcome) => outcome,
            None => Ok(Value::Nil),
        }
    }

    /// Pauses a worker at its next interrupt check
    pub fn pause(&self, id: usize) -> Result<()> {
        self.mailbox(id)?.pause();
        Ok(())
    }

    /// Resumes a paused worker
    pub fn resume(&self, id: usize) -> Result<()> {
        self.mailbox(id)?.resume();
        Ok(())
    }

    /// Asks a worker to stop at its next interrupt check
    pub fn cancel(&self, id: usize) -> Result<()> {
        self.mailbox(id)?.cancel();
        Ok(())
    }

    /// Cancels a worker and releases its slot without waiting
    ///
    /// The in-flight job stops at its next interrupt check; whatever it
    /// delivers afterwards is dropped with the orphaned mailbox. A job
    /// still sitting in the queue is removed outright.
    pub fn kill(&self, id: usize) -> Result<()> {
        let mailbox = self.mailbox(id)?;
        mailbox.cancel();
        let mut state = self.state.lock();
        state.queue.retain(|(queued, _)| *queued != id);
        if let Some(slot) = state.slots.get_mut(id) {
            *slot = None;
        }
        Ok(())
    }

    fn maybe_recycle(&self, id: usize, mailbox: &Ptr<Mailbox>) {
        let state = mailbox.state.lock();
        if state.result_taken && state.status_taken {
            drop(state);
            if let Some(slot) = self.state.lock().slots.get_mut(id) {
                *slot = None;
            }
        }
    }

    /// Cancels every worker and wakes every waiter
    pub fn interrupt_all(&self) {
        let state = self.state.lock();
        for mailbox in state.slots.iter().flatten() {
            mailbox.cancel();
        }
        drop(state);
        self.queue_cond.notify_all();
    }

    /// Shuts the pool down and joins the workers
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            for mailbox in state.slots.iter().flatten() {
                mailbox.cancel();
            }
            state.queue.clear();
        }
        self.queue_cond.notify_all();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }

        let mut state = self.state.lock();
        state.slots.clear();
        state.workers = 0;
        state.shutdown = false;
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new(crate::VmSettings::default().max_workers)
    }
}

fn worker_loop(ctx: Ptr<SharedContext>) {
    loop {
        let (id, job, mailbox) = {
            let mut state = ctx.threads.state.lock();
            loop {
                if state.shutdown {
                    state.workers -= 1;
                    return;
                }
                if let Some((id, job)) = state.queue.pop_front() {
                    let Some(mailbox) = state.slots.get(id).and_then(Clone::clone) else {
                        continue;
                    };
                    break (id, job, mailbox);
                }
                ctx.threads
                    .queue_cond
                    .wait_for(&mut state, JOIN_POLL);
            }
        };

        let mut vm = Vm::for_worker(ctx.clone(), mailbox.clone());
        let outcome = vm.run_job(job);
        if let Err(error) = &outcome {
            if !error.is_interrupt() {
                log::error!("worker {id} failed: {error}");
                ctx.raise_abort();
            }
        }
        mailbox.deliver(outcome);
    }
}
