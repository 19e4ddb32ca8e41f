//! a tiny LIFO object pool, for reusing scratch buffers (decode buffers, per-request
//! scratch vecs) across pipeline rounds.
//!
//! not wired into the rest of this crate; an opt-in utility for callers building their
//! own `ItemCodec`s or pipeline wrappers that want to avoid reallocating scratch state
//! every round.

/// pools values of type `T`, creating a new one via `new_func` whenever the pool is
/// empty, and dropping returned values once the pool reaches `max_size`.
pub struct ObjectPool<T> {
    objects: Vec<T>,
    max_size: usize,
    new_func: Box<dyn Fn() -> T>,
}

impl<T> ObjectPool<T> {
    /// build a pool whose objects are produced by `new_func`, holding at most
    /// `max_size` idle objects at a time.
    pub fn new<F>(new_func: F, max_size: usize) -> Self
    where
        F: Fn() -> T + 'static,
    {
        Self {
            objects: Vec::new(),
            max_size,
            new_func: Box::new(new_func),
        }
    }

    /// take an idle object, or create a fresh one if none are idle.
    pub fn get(&mut self) -> T {
        self.objects.pop().unwrap_or_else(|| (self.new_func)())
    }

    /// return `obj` to the pool. dropped instead if the pool is already at `max_size`.
    pub fn put(&mut self, obj: T) {
        if self.objects.len() >= self.max_size {
            return;
        }
        self.objects.push(obj);
    }

    /// number of objects currently idle in the pool.
    pub fn pool_size(&self) -> usize {
        self.objects.len()
    }
}
