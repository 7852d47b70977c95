use super::*;

/// A thread that opted in to being suspended while a profile is taken.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RegisteredThread {
  id: ThreadId,
  #[cfg(unix)]
  pthread: libc::pthread_t,
}

// SAFETY: `pthread_t` is an opaque handle; it is only passed back to
// `pthread_kill` and never dereferenced.
#[cfg(unix)]
unsafe impl Send for RegisteredThread {}

// SAFETY: see the `Send` impl.
#[cfg(unix)]
unsafe impl Sync for RegisteredThread {}

impl RegisteredThread {
  fn current() -> Self {
    Self {
      id: thread::current().id(),
      #[cfg(unix)]
      // SAFETY: `pthread_self` has no preconditions.
      pthread: unsafe { libc::pthread_self() },
    }
  }

  #[must_use]
  pub fn id(&self) -> ThreadId {
    self.id
  }

  #[cfg(unix)]
  #[must_use]
  pub fn pthread(&self) -> libc::pthread_t {
    self.pthread
  }
}

#[derive(Debug)]
struct Entry {
  registrations: usize,
  thread: RegisteredThread,
}

/// Registries the current thread has joined. Dropped when the thread exits,
/// which removes it from every registry that is still alive, whatever
/// guards were leaked.
struct Memberships {
  registries: RefCell<Vec<(ThreadId, Weak<ThreadRegistry>)>>,
}

impl Memberships {
  fn join(&self, id: ThreadId, registry: &Arc<ThreadRegistry>) {
    let mut registries = self.registries.borrow_mut();
    registries.retain(|(_, weak)| weak.strong_count() > 0);

    let target = Arc::as_ptr(registry);
    let known = registries
      .iter()
      .any(|(_, weak)| std::ptr::eq(weak.as_ptr(), target));
    if !known {
      registries.push((id, Arc::downgrade(registry)));
    }
  }
}

impl Drop for Memberships {
  fn drop(&mut self) {
    for (id, registry) in self.registries.get_mut().drain(..) {
      if let Some(registry) = registry.upgrade() {
        registry.remove(id);
      }
    }
  }
}

thread_local! {
  static MEMBERSHIPS: Memberships = const {
    Memberships {
      registries: RefCell::new(Vec::new()),
    }
  };
}

/// Threads that must be halted before the heap can be scanned.
///
/// Holding the registry lock also keeps threads from registering or leaving
/// mid-freeze.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
  threads: Mutex<Vec<Entry>>,
}

impl ThreadRegistry {
  fn deregister(&self, id: ThreadId) {
    let mut threads = self.lock_inner();

    if let Some(position) =
      threads.iter().position(|entry| entry.thread.id == id)
    {
      threads[position].registrations -= 1;
      if threads[position].registrations == 0 {
        threads.swap_remove(position);
      }
    }
  }

  #[cfg(test)]
  pub(crate) fn is_locked(&self) -> bool {
    matches!(self.threads.try_lock(), Err(std::sync::TryLockError::WouldBlock))
  }

  /// Take the registry lock for the duration of a freeze.
  #[must_use]
  pub fn lock(&self) -> LockedThreads<'_> {
    LockedThreads {
      guard: self.lock_inner(),
    }
  }

  fn lock_inner(&self) -> MutexGuard<'_, Vec<Entry>> {
    match self.threads.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the calling thread until the returned guard is dropped or the
  /// thread exits, whichever comes first.
  ///
  /// Nested registrations of the same thread are counted, so the thread stays
  /// registered until its last guard goes away. A thread that is already
  /// tearing down its thread-locals is not registered.
  #[must_use]
  pub fn register_current(self: &Arc<Self>) -> ThreadRegistration {
    let thread = RegisteredThread::current();

    let joined = MEMBERSHIPS
      .try_with(|memberships| memberships.join(thread.id, self))
      .is_ok();

    if joined {
      let mut threads = self.lock_inner();
      match threads.iter_mut().find(|entry| entry.thread.id == thread.id) {
        Some(entry) => entry.registrations += 1,
        None => threads.push(Entry {
          registrations: 1,
          thread,
        }),
      }
    }

    ThreadRegistration {
      id: thread.id,
      registry: Arc::clone(self),
      _not_send: PhantomData,
    }
  }

  /// Drop `id` outright, regardless of how many guards it still holds.
  fn remove(&self, id: ThreadId) {
    self.lock_inner().retain(|entry| entry.thread.id != id);
  }
}

/// Keeps the registering thread in its [`ThreadRegistry`] while alive.
///
/// Bound to the thread that created it; it cannot be sent elsewhere.
#[derive(Debug)]
pub struct ThreadRegistration {
  id: ThreadId,
  registry: Arc<ThreadRegistry>,
  _not_send: PhantomData<*const ()>,
}

impl Drop for ThreadRegistration {
  fn drop(&mut self) {
    self.registry.deregister(self.id);
  }
}

/// The registry while its lock is held.
#[derive(Debug)]
pub struct LockedThreads<'a> {
  guard: MutexGuard<'a, Vec<Entry>>,
}

impl LockedThreads<'_> {
  #[must_use]
  pub fn contains(&self, id: ThreadId) -> bool {
    self.guard.iter().any(|entry| entry.thread.id == id)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.guard.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &RegisteredThread> {
    self.guard.iter().map(|entry| &entry.thread)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.guard.len()
  }
}
