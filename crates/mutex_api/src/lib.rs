//! A simple mutex API.
#![no_std]

use core::ops::DerefMut;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    fn lock(&self) -> Self::Guard<'_>;
}

/// A condition variable paired with a specific [`Mutex`] implementation.
///
/// This is the trait form of a wait-channel: `wait` atomically releases `mutex`'s
/// guard and blocks the caller, reacquiring it before returning. `notify_all` wakes
/// every waiter, which must re-check its own predicate after waking (wakeups are
/// broadcast, not targeted).
pub trait CondVar<M>
where
    M: Mutex,
{
    /// Atomically releases `guard` and blocks until woken by [`CondVar::notify_all`],
    /// then reacquires the mutex and returns the new guard.
    fn wait<'a>(&self, guard: M::Guard<'a>) -> M::Guard<'a>;

    /// Wakes every thread currently blocked in [`CondVar::wait`].
    fn notify_all(&self);
}
