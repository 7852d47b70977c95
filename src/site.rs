use super::*;

/// Opaque identifier for an interned allocation stack.
///
/// `0` is reserved for "no stack captured".
pub type SiteId = u32;

/// Live bytes and chunk count attributed to a single allocation site.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[repr(C)]
pub struct AllocationSite {
  pub count: usize,
  pub site_id: SiteId,
  pub total_bytes: usize,
}

const SITE_BYTES: usize = size_of::<AllocationSite>();

/// Per-site aggregation table used while the world is frozen.
///
/// Storage comes from an anonymous mapping rather than the global allocator,
/// so recording a site never re-enters the allocator being profiled. Growth
/// remaps into a larger region and copies the existing records over.
#[derive(Debug)]
pub struct SiteIndex {
  len: usize,
  map: MmapMut,
}

impl SiteIndex {
  #[must_use]
  pub fn capacity(&self) -> usize {
    self.map.len() / SITE_BYTES
  }

  #[must_use]
  pub fn get(&self, site_id: SiteId) -> Option<&AllocationSite> {
    self.sites().iter().find(|site| site.site_id == site_id)
  }

  fn grow(&mut self) {
    let capacity = self.capacity().saturating_mul(2).max(1);

    let Ok(mut map) = map_sites(capacity) else {
      crate::fatal("memory profile: unable to grow the allocation site index");
    };

    let used = self.len * SITE_BYTES;
    map[..used].copy_from_slice(&self.map[..used]);
    self.map = map;
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.len
  }

  /// Add `bytes` to the total for `site_id`, creating its record if needed.
  pub fn record(&mut self, site_id: SiteId, bytes: usize) {
    // Linear lookup is good enough for the usual few hundred sites.
    if let Some(site) = self
      .sites_mut()
      .iter_mut()
      .find(|site| site.site_id == site_id)
    {
      site.total_bytes = site.total_bytes.saturating_add(bytes);
      site.count = site.count.saturating_add(1);
      return;
    }

    if self.len == self.capacity() {
      self.grow();
    }

    let site = AllocationSite {
      count: 1,
      site_id,
      total_bytes: bytes,
    };

    // SAFETY: `len < capacity`, so the slot lies inside the mapping, and the
    // mapping is page aligned which satisfies `AllocationSite`'s alignment.
    unsafe {
      self
        .map
        .as_mut_ptr()
        .cast::<AllocationSite>()
        .add(self.len)
        .write(site);
    }

    self.len += 1;
  }

  #[must_use]
  pub fn sites(&self) -> &[AllocationSite] {
    // SAFETY: the first `len` slots were written by `record`; the mapping is
    // page aligned and outlives the returned borrow.
    unsafe {
      slice::from_raw_parts(
        self.map.as_ptr().cast::<AllocationSite>(),
        self.len,
      )
    }
  }

  fn sites_mut(&mut self) -> &mut [AllocationSite] {
    // SAFETY: see `sites`; `&mut self` guarantees exclusive access.
    unsafe {
      slice::from_raw_parts_mut(
        self.map.as_mut_ptr().cast::<AllocationSite>(),
        self.len,
      )
    }
  }

  /// Order sites by descending `total_bytes`, breaking ties by ascending
  /// `site_id`. Sorts in place without allocating.
  pub fn sort_by_size(&mut self) {
    self.sites_mut().sort_unstable_by(|a, b| {
      b.total_bytes
        .cmp(&a.total_bytes)
        .then_with(|| a.site_id.cmp(&b.site_id))
    });
  }

  /// Reserve room for at least `capacity` sites.
  ///
  /// # Errors
  ///
  /// Returns an error if the anonymous mapping cannot be created.
  pub fn with_capacity(capacity: usize) -> io::Result<Self> {
    Ok(Self {
      len: 0,
      map: map_sites(capacity.max(1))?,
    })
  }
}

fn map_sites(capacity: usize) -> io::Result<MmapMut> {
  let bytes = capacity
    .checked_mul(SITE_BYTES)
    .ok_or_else(|| io::Error::other("site index capacity overflows usize"))?;

  MmapMut::map_anon(bytes)
}
