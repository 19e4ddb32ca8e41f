//! deferred-continuation scheduler.
//!
//! a [`Session`] is a FIFO queue of zero-argument continuations with an optional
//! lower-priority session attached to it. [`Session::execute`] drains the queue in
//! waves: continuations scheduled while a wave runs land in the next wave rather than
//! the current one, so it is always safe to call [`Session::add_next_call`] from inside
//! a continuation.
//!
//! the lower-priority chain lets item-layer work (cache-aside fill, set-back) run
//! strictly after all pending get-batches have been flushed by the pipeline layer,
//! without an explicit barrier: pipelines schedule their own bookkeeping on the session
//! handed to them, and hand out [`Session::get_lower`] to whatever sits beneath them.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

type NextCall = Box<dyn FnOnce()>;

struct Inner {
    queue: VecDeque<NextCall>,
    dirty: bool,
    higher: Option<Weak<RefCell<Inner>>>,
    lower: Option<Session>,
}

/// a cheaply cloneable handle to a shared, single-threaded continuation queue.
///
/// cloning a `Session` does not create a new queue; all clones observe the same
/// pending work. this crate's concurrency model is cooperative and single-threaded
/// (see the crate's module docs), so no internal locking is needed.
#[derive(Clone)]
pub struct Session(Rc<RefCell<Inner>>);

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Session {}

impl Session {
    /// create a fresh, empty session with no lower-priority session yet attached.
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Inner {
            queue: VecDeque::new(),
            dirty: false,
            higher: None,
            lower: None,
        })))
    }

    /// append `f` to this session's queue.
    ///
    /// marks this session dirty, and walks its lower-priority chain marking each in
    /// turn dirty too, stopping at the first link that is already dirty. this keeps an
    /// intermediate session's dirty flag accurate even when only a session above it
    /// received new work, so that an `execute()` issued from below still knows to
    /// cascade all the way up.
    pub fn add_next_call<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.0.borrow_mut().queue.push_back(Box::new(f));
        self.mark_dirty_downward();
    }

    fn mark_dirty_downward(&self) {
        let mut current = self.clone();
        loop {
            let lower = {
                let mut inner = current.0.borrow_mut();
                if inner.dirty {
                    return;
                }
                inner.dirty = true;
                inner.lower.clone()
            };
            match lower {
                Some(lower) => current = lower,
                None => return,
            }
        }
    }

    fn is_dirty(&self) -> bool {
        self.0.borrow().dirty
    }

    fn higher(&self) -> Option<Session> {
        self.0.borrow().higher.as_ref().and_then(Weak::upgrade).map(Session)
    }

    /// returns (creating it the first time) a session whose `execute()` drains this
    /// session first, as its highest-priority predecessor.
    pub fn get_lower(&self) -> Session {
        if let Some(lower) = self.0.borrow().lower.clone() {
            return lower;
        }

        let lower = Session(Rc::new(RefCell::new(Inner {
            queue: VecDeque::new(),
            dirty: false,
            higher: Some(Rc::downgrade(&self.0)),
            lower: None,
        })));

        self.0.borrow_mut().lower = Some(lower.clone());
        lower
    }

    /// drain this session and, transitively, every dirty session above it in the
    /// priority chain.
    ///
    /// a no-op if this session is not dirty. otherwise the immediate higher-priority
    /// session is drained first (if it is itself dirty), then this session's queue is
    /// run in FIFO waves until a full pass adds nothing new.
    pub fn execute(&self) {
        if !self.is_dirty() {
            return;
        }

        if let Some(higher) = self.higher() {
            if higher.is_dirty() {
                higher.execute();
            }
        }

        loop {
            let batch: Vec<NextCall> = {
                let mut inner = self.0.borrow_mut();
                inner.dirty = false;
                inner.queue.drain(..).collect()
            };

            if batch.is_empty() {
                break;
            }

            for call in batch {
                call();
            }

            if !self.is_dirty() {
                break;
            }
        }
    }
}
