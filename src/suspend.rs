use super::*;

/// Halts every registered thread other than the caller while a callback runs.
///
/// Implementations must resume every halted thread on all exit paths,
/// including when `callback` unwinds. Failing to halt or resume is fatal.
pub trait WorldSuspender {
  fn stop_the_world(
    &self,
    threads: &LockedThreads<'_>,
    callback: &mut dyn FnMut(),
  );
}

/// Runs the callback without halting anything.
///
/// Only sound when the embedder guarantees no other thread touches the heap,
/// e.g. single-threaded programs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSuspender;

impl WorldSuspender for PassthroughSuspender {
  fn stop_the_world(
    &self,
    _threads: &LockedThreads<'_>,
    callback: &mut dyn FnMut(),
  ) {
    callback();
  }
}

#[cfg(unix)]
static FREEZE_LOCK: Mutex<()> = Mutex::new(());

#[cfg(unix)]
static WORLD_STOPPED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
static PARKED: AtomicUsize = AtomicUsize::new(0);

/// Parks the interrupted thread until the world is resumed.
///
/// Only atomics and `sched_yield` are used here; both are safe inside a
/// signal handler.
#[cfg(unix)]
extern "C" fn park_on_signal(_signal: libc::c_int) {
  PARKED.fetch_add(1, Ordering::AcqRel);

  while WORLD_STOPPED.load(Ordering::Acquire) {
    // SAFETY: `sched_yield` has no preconditions.
    unsafe {
      libc::sched_yield();
    }
  }

  PARKED.fetch_sub(1, Ordering::AcqRel);
}

/// Suspends registered threads by signalling them into a parking handler.
///
/// One freeze at a time is allowed process-wide. Registered threads must not
/// block the suspend signal.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct SignalSuspender {
  signal: libc::c_int,
  timeout: Duration,
}

#[cfg(unix)]
impl SignalSuspender {
  /// Install the parking handler for `signal`.
  ///
  /// # Errors
  ///
  /// Returns the OS error if the handler cannot be installed.
  pub fn new(signal: libc::c_int, timeout: Duration) -> io::Result<Self> {
    // SAFETY: a zeroed `sigaction` is a valid value to fill in, and the
    // installed handler is async-signal-safe.
    unsafe {
      let mut action: libc::sigaction = std::mem::zeroed();
      action.sa_sigaction =
        park_on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
      action.sa_flags = libc::SA_RESTART;
      libc::sigemptyset(&mut action.sa_mask);

      if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
        return Err(io::Error::last_os_error());
      }
    }

    debug!(signal, "installed world-suspend signal handler");

    Ok(Self { signal, timeout })
  }

  #[must_use]
  pub fn signal(&self) -> libc::c_int {
    self.signal
  }

  #[must_use]
  pub fn timeout(&self) -> Duration {
    self.timeout
  }
}

#[cfg(unix)]
impl WorldSuspender for SignalSuspender {
  fn stop_the_world(
    &self,
    threads: &LockedThreads<'_>,
    callback: &mut dyn FnMut(),
  ) {
    let _serial = FREEZE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let me = thread::current().id();

    let world = StoppedWorld::stop();

    let mut expected = 0;
    for thread in threads.iter().filter(|thread| thread.id() != me) {
      // SAFETY: registered threads are alive until they deregister, which
      // cannot happen while the registry lock is held.
      let rc = unsafe { libc::pthread_kill(thread.pthread(), self.signal) };
      if rc != 0 {
        drop(world);
        crate::fatal("memory profile: failed to signal a registered thread");
      }
      expected += 1;
    }

    world.wait_until_parked(expected, self.timeout);

    callback();
  }
}

/// Holds the world stopped; dropping it releases every parked thread and
/// waits until they have all left the handler.
#[cfg(unix)]
struct StoppedWorld;

#[cfg(unix)]
impl StoppedWorld {
  fn stop() -> Self {
    WORLD_STOPPED.store(true, Ordering::Release);
    Self
  }

  fn wait_until_parked(&self, expected: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;

    while PARKED.load(Ordering::Acquire) < expected {
      if Instant::now() >= deadline {
        WORLD_STOPPED.store(false, Ordering::Release);
        crate::fatal("memory profile: timed out suspending registered threads");
      }
      thread::yield_now();
    }
  }
}

#[cfg(unix)]
impl Drop for StoppedWorld {
  fn drop(&mut self) {
    WORLD_STOPPED.store(false, Ordering::Release);

    while PARKED.load(Ordering::Acquire) != 0 {
      thread::yield_now();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn passthrough_runs_callback_once() {
    let registry = ThreadRegistry::new();
    let mut calls = 0;

    PassthroughSuspender.stop_the_world(&registry.lock(), &mut || calls += 1);

    assert_eq!(calls, 1);
  }

  #[cfg(unix)]
  mod signal {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Workers {
      counters: Vec<Arc<AtomicU64>>,
      done: Arc<AtomicBool>,
      handles: Vec<thread::JoinHandle<()>>,
    }

    impl Workers {
      fn spawn(registry: &Arc<ThreadRegistry>, count: usize) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let mut counters = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..count {
          let counter = Arc::new(AtomicU64::new(0));
          let registry = Arc::clone(registry);
          let done = Arc::clone(&done);
          let worker_counter = Arc::clone(&counter);

          handles.push(thread::spawn(move || {
            let _registration = registry.register_current();
            while !done.load(Ordering::Acquire) {
              worker_counter.fetch_add(1, Ordering::Relaxed);
              std::hint::spin_loop();
            }
          }));
          counters.push(counter);
        }

        for counter in &counters {
          while counter.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
          }
        }

        Self {
          counters,
          done,
          handles,
        }
      }

      fn read(&self) -> Vec<u64> {
        self
          .counters
          .iter()
          .map(|counter| counter.load(Ordering::Relaxed))
          .collect()
      }

      fn wait_for_progress(&self, since: &[u64]) {
        for (counter, before) in self.counters.iter().zip(since) {
          while counter.load(Ordering::Relaxed) == *before {
            thread::yield_now();
          }
        }
      }

      fn finish(self) {
        self.done.store(true, Ordering::Release);
        for handle in self.handles {
          handle.join().expect("worker panicked");
        }
      }
    }

    fn suspender() -> SignalSuspender {
      SignalSuspender::new(libc::SIGUSR2, Duration::from_secs(10))
        .expect("install handler")
    }

    #[test]
    fn registered_threads_make_no_progress_while_stopped() {
      let registry = Arc::new(ThreadRegistry::new());
      let workers = Workers::spawn(&registry, 2);
      let suspender = suspender();

      let mut frozen = (Vec::new(), Vec::new());
      suspender.stop_the_world(&registry.lock(), &mut || {
        frozen.0 = workers.read();
        thread::sleep(Duration::from_millis(50));
        frozen.1 = workers.read();
      });

      assert_eq!(frozen.0, frozen.1);

      workers.wait_for_progress(&frozen.1);
      workers.finish();
    }

    #[test]
    fn threads_resume_when_callback_panics() {
      let registry = Arc::new(ThreadRegistry::new());
      let workers = Workers::spawn(&registry, 1);
      let suspender = suspender();

      let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        suspender.stop_the_world(&registry.lock(), &mut || {
          panic!("scan failed");
        });
      }));
      assert!(outcome.is_err());

      let after = workers.read();
      workers.wait_for_progress(&after);
      workers.finish();
    }

    #[test]
    fn caller_is_never_signalled() {
      let registry = Arc::new(ThreadRegistry::new());
      let _me = registry.register_current();
      let suspender = suspender();

      let mut ran = false;
      suspender.stop_the_world(&registry.lock(), &mut || ran = true);

      assert!(ran);
    }
  }
}
