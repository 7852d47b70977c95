//! Point-in-time heap profiler.
//!
//! A profile freezes every registered thread, walks each chunk the heap knows
//! about exactly once, aggregates live bytes by allocation site and, once the
//! world runs again, prints the largest sites ranked by live bytes.
//!
//! The scan itself never allocates through the global allocator: the site
//! index lives in an anonymous mapping reserved before the freeze begins.

mod chunk;
mod config;
mod export;
mod freeze;
mod heap;
mod profile;
mod report;
mod site;
mod stack;
mod stack_capture;
mod state;
mod suspend;
mod threads;

use {
  backtrace::{Frame, SymbolName},
  memmap2::MmapMut,
  nohash_hasher::BuildNoHashHasher,
  serde::{Serialize, Serializer, ser::SerializeStruct},
  std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    ffi::OsStr,
    fmt::{self, Display, Formatter},
    io::{self, Write},
    marker::PhantomData,
    mem::size_of,
    slice,
    sync::{
      Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
      atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
  },
  tracing::{debug, info, warn},
};

pub use {
  chunk::{ChunkSource, ChunkState, ChunkView, HeapLock},
  config::ProfilerConfig,
  export::ExportError,
  freeze::Freezer,
  heap::{ChunkId, HeapError, HeapStats, LockedHeap, TrackedHeap},
  profile::{HeapProfile, Tallies},
  report::{ReportOptions, render},
  site::{AllocationSite, SiteId, SiteIndex},
  stack::{FrameMetadata, SiteResolver, StackDepot, StackMetadata},
  stack_capture::StackCollector,
  state::{
    Profiler, ProfilerBuilder, install, installed, print_memory_profile,
  },
  suspend::{PassthroughSuspender, WorldSuspender},
  threads::{
    LockedThreads, RegisteredThread, ThreadRegistration, ThreadRegistry,
  },
};

#[cfg(unix)]
pub use suspend::SignalSuspender;

/// Write `message` to stderr and abort the process.
///
/// Bypasses `std::io::Stderr` so it cannot block on a lock held by a
/// suspended thread.
pub(crate) fn fatal(message: &str) -> ! {
  #[cfg(unix)]
  for part in [message.as_bytes(), b"\n".as_slice()] {
    // SAFETY: `part` is a valid, initialised buffer of `part.len()` bytes.
    unsafe {
      libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len());
    }
  }

  #[cfg(not(unix))]
  eprintln!("{message}");

  std::process::abort()
}
