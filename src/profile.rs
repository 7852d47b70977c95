use super::*;

/// Snapshot-wide counters, reset at the start of every profile.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct Tallies {
  pub live_bytes: usize,
  pub live_count: usize,
  pub other_count: usize,
  pub quarantined_bytes: usize,
  pub quarantined_count: usize,
}

impl Tallies {
  /// Every chunk observed, whatever its state.
  #[must_use]
  pub fn total_chunks(&self) -> usize {
    self
      .live_count
      .saturating_add(self.quarantined_count)
      .saturating_add(self.other_count)
  }
}

/// Classifies chunks and aggregates live ones by allocation site.
///
/// Built before the world is frozen so that `observe` never has to allocate.
#[derive(Debug)]
pub struct HeapProfile {
  sites: SiteIndex,
  tallies: Tallies,
}

impl Serialize for HeapProfile {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut state = serializer.serialize_struct("HeapProfile", 2)?;
    state.serialize_field("tallies", &self.tallies)?;
    state.serialize_field("sites", self.sites.sites())?;
    state.end()
  }
}

impl HeapProfile {
  /// Serialize the tallies and per-site records as JSON.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization or the writer fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), ExportError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }

  /// Route one chunk to the site index and the matching tally.
  pub fn observe(&mut self, chunk: ChunkView) {
    match chunk.state() {
      ChunkState::Live => {
        let size = chunk.used_size();
        self.tallies.live_bytes = self.tallies.live_bytes.saturating_add(size);
        self.tallies.live_count = self.tallies.live_count.saturating_add(1);

        if let Some(site_id) = chunk.alloc_site() {
          self.sites.record(site_id, size);
        }
      }
      ChunkState::Quarantined => {
        self.tallies.quarantined_bytes = self
          .tallies
          .quarantined_bytes
          .saturating_add(chunk.used_size());
        self.tallies.quarantined_count =
          self.tallies.quarantined_count.saturating_add(1);
      }
      ChunkState::Other => {
        self.tallies.other_count = self.tallies.other_count.saturating_add(1);
      }
    }
  }

  /// Observe every chunk `source` yields.
  pub fn scan<S: ChunkSource + ?Sized>(&mut self, source: &S) {
    source.for_each_chunk(&mut |chunk| self.observe(chunk));
  }

  #[must_use]
  pub fn sites(&self) -> &SiteIndex {
    &self.sites
  }

  pub(crate) fn sites_mut(&mut self) -> &mut SiteIndex {
    &mut self.sites
  }

  #[must_use]
  pub fn tallies(&self) -> &Tallies {
    &self.tallies
  }

  /// # Errors
  ///
  /// Returns an error if the site index cannot be reserved.
  pub fn with_capacity(site_capacity: usize) -> io::Result<Self> {
    Ok(Self {
      sites: SiteIndex::with_capacity(site_capacity)?,
      tallies: Tallies::default(),
    })
  }
}
