use super::*;

/// Handle for a chunk registered with a [`TrackedHeap`].
pub type ChunkId = u64;

#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
  site_id: SiteId,
  size: usize,
  state: ChunkState,
}

impl ChunkRecord {
  fn view(&self) -> ChunkView {
    match self.state {
      ChunkState::Live => ChunkView::live(self.size, self.site_id),
      ChunkState::Quarantined => ChunkView::quarantined(self.size),
      ChunkState::Other => ChunkView::other(self.size),
    }
  }
}

/// Running counters kept by a [`TrackedHeap`].
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct HeapStats {
  pub allocations: u64,
  pub deallocations: u64,
  pub evictions: u64,
  pub internal_allocations: u64,
}

impl Display for HeapStats {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Heap stats: {} allocation(s), {} deallocation(s), {} internal \
       allocation(s), {} quarantine eviction(s)",
      self.allocations,
      self.deallocations,
      self.internal_allocations,
      self.evictions
    )
  }
}

/// Errors reported when releasing chunks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HeapError {
  DoubleFree(ChunkId),
  UnknownChunk(ChunkId),
}

impl Display for HeapError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::DoubleFree(id) => write!(f, "chunk {id} freed twice"),
      Self::UnknownChunk(id) => write!(f, "chunk {id} is not tracked"),
    }
  }
}

impl std::error::Error for HeapError {}

#[derive(Debug, Default)]
struct HeapInner {
  chunks: HashMap<ChunkId, ChunkRecord, BuildNoHashHasher<ChunkId>>,
  next_id: ChunkId,
  quarantine: VecDeque<ChunkId>,
  quarantined_bytes: usize,
  stats: HeapStats,
}

impl HeapInner {
  fn evict_over(&mut self, limit: usize) {
    while self.quarantined_bytes > limit {
      let Some(id) = self.quarantine.pop_front() else {
        break;
      };

      if let Some(record) = self.chunks.remove(&id) {
        self.quarantined_bytes -= record.size;
        self.stats.evictions += 1;
      }
    }
  }

  fn insert(&mut self, record: ChunkRecord) -> ChunkId {
    self.next_id += 1;
    let id = self.next_id;
    self.chunks.insert(id, record);
    id
  }
}

/// Chunk registry with a FIFO quarantine for freed chunks.
///
/// Embedders report allocations and frees; the profiler enumerates the
/// registry through [`HeapLock`] while the world is frozen.
#[derive(Debug)]
pub struct TrackedHeap {
  inner: Mutex<HeapInner>,
  quarantine_limit: usize,
}

impl Default for TrackedHeap {
  fn default() -> Self {
    Self::new(ProfilerConfig::default().quarantine_bytes)
  }
}

impl TrackedHeap {
  /// Register a live user chunk of `size` bytes allocated at `site_id`.
  pub fn allocate(&self, size: usize, site_id: SiteId) -> ChunkId {
    let mut inner = self.lock_inner();
    inner.stats.allocations += 1;
    inner.insert(ChunkRecord {
      site_id,
      size,
      state: ChunkState::Live,
    })
  }

  /// Register a chunk owned by the allocator itself.
  pub fn allocate_internal(&self, size: usize) -> ChunkId {
    let mut inner = self.lock_inner();
    inner.stats.internal_allocations += 1;
    inner.insert(ChunkRecord {
      site_id: 0,
      size,
      state: ChunkState::Other,
    })
  }

  /// Release a chunk. User chunks move to quarantine; internal chunks are
  /// dropped immediately.
  ///
  /// # Errors
  ///
  /// Returns an error if the chunk is already quarantined or unknown.
  pub fn deallocate(&self, id: ChunkId) -> Result<(), HeapError> {
    let mut inner = self.lock_inner();

    let Some(record) = inner.chunks.get_mut(&id) else {
      return Err(HeapError::UnknownChunk(id));
    };

    let state = record.state;
    match state {
      ChunkState::Quarantined => return Err(HeapError::DoubleFree(id)),
      ChunkState::Other => {
        inner.chunks.remove(&id);
      }
      ChunkState::Live => {
        record.state = ChunkState::Quarantined;
        let size = record.size;

        inner.stats.deallocations += 1;
        inner.quarantine.push_back(id);
        inner.quarantined_bytes += size;
        inner.evict_over(self.quarantine_limit);
      }
    }

    Ok(())
  }

  fn lock_inner(&self) -> MutexGuard<'_, HeapInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  #[must_use]
  pub fn new(quarantine_limit: usize) -> Self {
    Self {
      inner: Mutex::new(HeapInner::default()),
      quarantine_limit,
    }
  }

  #[must_use]
  pub fn quarantined_bytes(&self) -> usize {
    self.lock_inner().quarantined_bytes
  }

  #[must_use]
  pub fn stats(&self) -> HeapStats {
    self.lock_inner().stats
  }
}

impl HeapLock for TrackedHeap {
  type Locked<'a> = LockedHeap<'a>;

  fn lock_heap(&self) -> Self::Locked<'_> {
    LockedHeap {
      guard: self.lock_inner(),
    }
  }
}

/// A [`TrackedHeap`] with its lock held.
#[derive(Debug)]
pub struct LockedHeap<'a> {
  guard: MutexGuard<'a, HeapInner>,
}

impl ChunkSource for LockedHeap<'_> {
  fn for_each_chunk(&self, visit: &mut dyn FnMut(ChunkView)) {
    for record in self.guard.chunks.values() {
      visit(record.view());
    }
  }
}
