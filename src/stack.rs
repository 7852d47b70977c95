use super::*;

/// Metadata describing a single frame in a stack trace.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FrameMetadata {
  pub filename: Arc<str>,
  pub function: Arc<str>,
  pub lineno: u32,
}

impl FrameMetadata {
  #[must_use]
  pub fn new(
    filename: impl Into<String>,
    function: impl Into<String>,
    lineno: u32,
  ) -> Self {
    Self {
      filename: Arc::<str>::from(filename.into()),
      function: Arc::<str>::from(function.into()),
      lineno,
    }
  }
}

impl Display for FrameMetadata {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}:{}", self.function, self.filename, self.lineno)
  }
}

/// Resolved frames for an interned allocation site.
#[derive(Debug, Clone)]
pub struct StackMetadata {
  frames: Arc<[FrameMetadata]>,
  id: SiteId,
}

impl StackMetadata {
  #[must_use]
  pub fn frames(&self) -> &[FrameMetadata] {
    &self.frames
  }

  #[must_use]
  pub fn id(&self) -> SiteId {
    self.id
  }
}

/// Turns a site identifier into a printed stack trace.
pub trait SiteResolver {
  /// Write the symbolized trace for `site_id` to `out`.
  ///
  /// # Errors
  ///
  /// Returns an error if writing to `out` fails.
  fn write_trace(&self, site_id: SiteId, out: &mut dyn Write)
  -> io::Result<()>;
}

#[derive(Debug)]
struct StackDepotInner {
  by_frames: HashMap<Vec<FrameMetadata>, SiteId>,
  by_id: HashMap<SiteId, Arc<StackMetadata>, BuildNoHashHasher<SiteId>>,
  next_id: SiteId,
}

impl Default for StackDepotInner {
  fn default() -> Self {
    Self {
      by_frames: HashMap::new(),
      by_id: HashMap::default(),
      next_id: 1,
    }
  }
}

impl StackDepotInner {
  fn store(&mut self, site_id: SiteId, frames: Vec<FrameMetadata>) {
    let metadata = Arc::new(StackMetadata {
      frames: Arc::from(frames.clone().into_boxed_slice()),
      id: site_id,
    });
    self.by_frames.insert(frames, site_id);
    self.by_id.insert(site_id, metadata);
  }
}

/// Interns allocation stacks and hands out stable, non-zero site ids.
#[derive(Debug, Default)]
pub struct StackDepot {
  inner: Mutex<StackDepotInner>,
}

impl StackDepot {
  /// Explicitly associate frames with a site identifier.
  ///
  /// Useful for plumbing ids captured outside this crate. Id `0` is reserved
  /// and ignored.
  pub fn insert_with_id<I>(&self, site_id: SiteId, frames: I)
  where
    I: Into<Vec<FrameMetadata>>,
  {
    if site_id == 0 {
      return;
    }

    let mut inner = self.lock_inner();
    inner.store(site_id, frames.into());

    if inner.next_id <= site_id {
      inner.next_id = site_id.saturating_add(1);
    }
  }

  /// Intern `frames` and return their site id.
  ///
  /// Returns `0` once the id space is exhausted.
  pub fn intern<I>(&self, frames: I) -> SiteId
  where
    I: Into<Vec<FrameMetadata>>,
  {
    let frames: Vec<FrameMetadata> = frames.into();
    let mut inner = self.lock_inner();
    if let Some(existing) = inner.by_frames.get(&frames).copied() {
      return existing;
    }

    let site_id = inner.next_id;
    if site_id == SiteId::MAX {
      return 0;
    }
    inner.next_id += 1;
    inner.store(site_id, frames);

    site_id
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.lock_inner().by_id.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock_inner(&self) -> MutexGuard<'_, StackDepotInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Resolve a site identifier back into its frames, if known.
  #[must_use]
  pub fn resolve(&self, site_id: SiteId) -> Option<Arc<StackMetadata>> {
    self.lock_inner().by_id.get(&site_id).cloned()
  }
}

impl SiteResolver for StackDepot {
  fn write_trace(
    &self,
    site_id: SiteId,
    out: &mut dyn Write,
  ) -> io::Result<()> {
    match self.resolve(site_id) {
      Some(stack) => {
        for (depth, frame) in stack.frames().iter().enumerate() {
          writeln!(out, "    #{depth} {frame}")?;
        }
      }
      None => writeln!(out, "    <unknown allocation site {site_id}>")?,
    }

    writeln!(out)
  }
}
