use super::*;

/// Runs a scan with the thread registry and heap locked and every other
/// registered thread suspended.
///
/// Locks are taken registry first, then heap, and released in reverse order
/// after the world resumes, on every exit path.
#[derive(Debug)]
pub struct Freezer<'a, H: ?Sized, S: ?Sized> {
  heap: &'a H,
  suspender: &'a S,
  threads: &'a ThreadRegistry,
}

impl<'a, H, S> Freezer<'a, H, S>
where
  H: HeapLock + ?Sized,
  S: WorldSuspender + ?Sized,
{
  #[must_use]
  pub fn new(
    threads: &'a ThreadRegistry,
    heap: &'a H,
    suspender: &'a S,
  ) -> Self {
    Self {
      heap,
      suspender,
      threads,
    }
  }

  /// Call `callback` with the locked heap while the world is frozen.
  ///
  /// `callback` must not allocate through the global allocator or log: a
  /// suspended thread may be holding either lock.
  pub fn run_under_freeze<F, R>(&self, callback: F) -> R
  where
    F: FnOnce(&dyn ChunkSource) -> R,
  {
    let mut callback = Some(callback);
    let mut result = None;

    debug!("freezing the world");

    platform::enter(&mut || {
      let threads = self.threads.lock();
      let heap = self.heap.lock_heap();

      self.suspender.stop_the_world(&threads, &mut || {
        if let Some(callback) = callback.take() {
          result = Some(callback(&heap));
        }
      });

      drop(heap);
      drop(threads);
    });

    debug!("world resumed");

    match result {
      Some(result) => result,
      None => crate::fatal("memory profile: world suspension skipped the scan"),
    }
  }
}

// Symbolizing through `dl_iterate_phdr` takes the loader's lock. Suspending a
// thread that holds it would deadlock the report, so the freeze is entered
// from inside the iteration, once the lock is ours.
#[cfg(any(target_os = "linux", target_os = "netbsd"))]
mod platform {
  use std::{
    any::Any,
    ffi::c_void,
    panic::{self, AssertUnwindSafe},
  };

  struct Trampoline<'a> {
    body: &'a mut dyn FnMut(),
    entered: bool,
    panic: Option<Box<dyn Any + Send>>,
  }

  unsafe extern "C" fn enter_holding_loader_lock(
    _info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
  ) -> libc::c_int {
    // SAFETY: `data` is the trampoline handed to `dl_iterate_phdr` by
    // `enter`, which outlives the iteration.
    let trampoline = unsafe { &mut *data.cast::<Trampoline<'_>>() };

    if !trampoline.entered {
      trampoline.entered = true;

      let outcome =
        panic::catch_unwind(AssertUnwindSafe(|| (trampoline.body)()));
      if let Err(payload) = outcome {
        trampoline.panic = Some(payload);
      }
    }

    1
  }

  pub(super) fn enter(body: &mut dyn FnMut()) {
    let mut trampoline = Trampoline {
      body,
      entered: false,
      panic: None,
    };

    // SAFETY: the callback only runs for the duration of this call and the
    // trampoline stays borrowed until it returns.
    unsafe {
      libc::dl_iterate_phdr(
        Some(enter_holding_loader_lock),
        (&raw mut trampoline).cast(),
      );
    }

    if let Some(payload) = trampoline.panic {
      panic::resume_unwind(payload);
    }

    if !trampoline.entered {
      (trampoline.body)();
    }
  }
}

#[cfg(not(any(target_os = "linux", target_os = "netbsd")))]
mod platform {
  pub(super) fn enter(body: &mut dyn FnMut()) {
    body();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::panic::{self, AssertUnwindSafe};

  #[derive(Default)]
  struct Journal {
    events: Mutex<Vec<&'static str>>,
  }

  impl Journal {
    fn push(&self, event: &'static str) {
      self
        .events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(event);
    }

    fn events(&self) -> Vec<&'static str> {
      self
        .events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    }
  }

  struct ScriptedHeap<'j> {
    chunks: Vec<ChunkView>,
    journal: &'j Journal,
    registry: &'j ThreadRegistry,
  }

  struct ScriptedGuard<'a, 'j> {
    heap: &'a ScriptedHeap<'j>,
  }

  impl ChunkSource for ScriptedGuard<'_, '_> {
    fn for_each_chunk(&self, visit: &mut dyn FnMut(ChunkView)) {
      self.heap.chunks.for_each_chunk(visit);
    }
  }

  impl Drop for ScriptedGuard<'_, '_> {
    fn drop(&mut self) {
      if self.heap.registry.is_locked() {
        self.heap.journal.push("heap unlocked before registry");
      }
    }
  }

  impl<'j> HeapLock for ScriptedHeap<'j> {
    type Locked<'a>
      = ScriptedGuard<'a, 'j>
    where
      Self: 'a;

    fn lock_heap(&self) -> Self::Locked<'_> {
      if self.registry.is_locked() {
        self.journal.push("heap locked after registry");
      }
      ScriptedGuard { heap: self }
    }
  }

  struct ScriptedSuspender<'j> {
    journal: &'j Journal,
  }

  struct Resume<'j>(&'j Journal);

  impl Drop for Resume<'_> {
    fn drop(&mut self) {
      self.0.push("resume");
    }
  }

  impl WorldSuspender for ScriptedSuspender<'_> {
    fn stop_the_world(
      &self,
      _threads: &LockedThreads<'_>,
      callback: &mut dyn FnMut(),
    ) {
      self.journal.push("suspend");
      let _resume = Resume(self.journal);
      callback();
    }
  }

  #[test]
  fn locks_suspends_and_releases_in_order() {
    let journal = Journal::default();
    let registry = ThreadRegistry::new();
    let heap = ScriptedHeap {
      chunks: vec![ChunkView::live(10, 1), ChunkView::other(4)],
      journal: &journal,
      registry: &registry,
    };
    let suspender = ScriptedSuspender { journal: &journal };

    let seen = Freezer::new(&registry, &heap, &suspender).run_under_freeze(
      |source| {
        journal.push("scan");
        let mut seen = 0;
        source.for_each_chunk(&mut |_| seen += 1);
        seen
      },
    );

    assert_eq!(seen, 2);
    assert_eq!(
      journal.events(),
      vec![
        "heap locked after registry",
        "suspend",
        "scan",
        "resume",
        "heap unlocked before registry",
      ]
    );
    assert!(!registry.is_locked());
  }

  #[test]
  fn releases_everything_when_the_scan_panics() {
    let journal = Journal::default();
    let registry = ThreadRegistry::new();
    let heap = ScriptedHeap {
      chunks: Vec::new(),
      journal: &journal,
      registry: &registry,
    };
    let suspender = ScriptedSuspender { journal: &journal };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
      Freezer::new(&registry, &heap, &suspender)
        .run_under_freeze(|_| -> () { panic!("scan failed") })
    }));

    assert!(outcome.is_err());
    assert_eq!(
      journal.events(),
      vec![
        "heap locked after registry",
        "suspend",
        "resume",
        "heap unlocked before registry",
      ]
    );
    assert!(!registry.is_locked());
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn loader_lock_is_held_for_the_whole_freeze() {
    use std::ffi::c_void;

    unsafe extern "C" fn visit(
      _info: *mut libc::dl_phdr_info,
      _size: libc::size_t,
      _data: *mut c_void,
    ) -> libc::c_int {
      0
    }

    let start = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    let (worker_start, worker_done) = (Arc::clone(&start), Arc::clone(&done));
    let walker = thread::spawn(move || {
      while !worker_start.load(Ordering::Acquire) {
        thread::yield_now();
      }
      // SAFETY: `visit` ignores its arguments and stops nothing.
      unsafe {
        libc::dl_iterate_phdr(Some(visit), std::ptr::null_mut());
      }
      worker_done.store(true, Ordering::Release);
    });

    let registry = ThreadRegistry::new();
    let heap = TrackedHeap::new(0);
    heap.allocate(16, 1);

    let walked_during_freeze = Freezer::new(
      &registry,
      &heap,
      &PassthroughSuspender,
    )
    .run_under_freeze(|_| {
      start.store(true, Ordering::Release);
      thread::sleep(Duration::from_millis(100));
      done.load(Ordering::Acquire)
    });

    walker.join().expect("walker panicked");
    assert!(!walked_during_freeze);
    assert!(done.load(Ordering::Acquire));
  }

  #[test]
  fn freezes_are_repeatable() {
    let registry = ThreadRegistry::new();
    let heap = TrackedHeap::new(0);
    heap.allocate(32, 5);
    let freezer = Freezer::new(&registry, &heap, &PassthroughSuspender);

    for _ in 0..3 {
      let count = freezer.run_under_freeze(|source| {
        let mut count = 0;
        source.for_each_chunk(&mut |_| count += 1);
        count
      });
      assert_eq!(count, 1);
    }
  }
}
