use super::*;

/// Lifecycle state of a heap chunk as seen by the profiler.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChunkState {
  /// Allocated and not yet freed.
  Live,
  /// Freed, but held back from reuse so stale accesses can still be caught.
  Quarantined,
  /// Anything else the allocator tracks, e.g. its own bookkeeping chunks.
  Other,
}

/// Read-only view of one allocator chunk, handed out during enumeration.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChunkView {
  site_id: SiteId,
  state: ChunkState,
  used_size: usize,
}

impl ChunkView {
  /// Allocation site of a live chunk; `None` for other states or when no
  /// stack was captured.
  #[must_use]
  pub fn alloc_site(&self) -> Option<SiteId> {
    match self.state {
      ChunkState::Live if self.site_id != 0 => Some(self.site_id),
      _ => None,
    }
  }

  #[must_use]
  pub fn live(used_size: usize, site_id: SiteId) -> Self {
    Self {
      site_id,
      state: ChunkState::Live,
      used_size,
    }
  }

  #[must_use]
  pub fn other(used_size: usize) -> Self {
    Self {
      site_id: 0,
      state: ChunkState::Other,
      used_size,
    }
  }

  #[must_use]
  pub fn quarantined(used_size: usize) -> Self {
    Self {
      site_id: 0,
      state: ChunkState::Quarantined,
      used_size,
    }
  }

  #[must_use]
  pub fn state(&self) -> ChunkState {
    self.state
  }

  /// Bytes requested by the user for this chunk.
  #[must_use]
  pub fn used_size(&self) -> usize {
    self.used_size
  }
}

/// Something that can enumerate every chunk it knows about.
///
/// Implementations must visit each chunk exactly once and must not allocate
/// through the global allocator while doing so.
pub trait ChunkSource {
  fn for_each_chunk(&self, visit: &mut dyn FnMut(ChunkView));
}

impl ChunkSource for [ChunkView] {
  fn for_each_chunk(&self, visit: &mut dyn FnMut(ChunkView)) {
    for chunk in self {
      visit(*chunk);
    }
  }
}

/// The allocator lock. Chunks can only be enumerated through the guard, which
/// keeps the heap consistent for the duration of a scan.
pub trait HeapLock {
  type Locked<'a>: ChunkSource
  where
    Self: 'a;

  fn lock_heap(&self) -> Self::Locked<'_>;
}
