use super::*;

type BoxedSuspender = Box<dyn WorldSuspender + Send + Sync>;

/// Thin builder that customizes `ProfilerConfig` without exposing all knobs
/// up front.
#[derive(Default)]
pub struct ProfilerBuilder {
  config: ProfilerConfig,
  suspender: Option<BoxedSuspender>,
}

impl fmt::Debug for ProfilerBuilder {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProfilerBuilder")
      .field("config", &self.config)
      .field("custom_suspender", &self.suspender.is_some())
      .finish()
  }
}

impl ProfilerBuilder {
  /// Build the profiler, installing the default world suspender unless one
  /// was supplied.
  ///
  /// # Errors
  ///
  /// Returns an error if the suspend signal handler cannot be installed.
  pub fn finish(self) -> io::Result<Profiler> {
    let suspender = match self.suspender {
      Some(suspender) => suspender,
      None => default_suspender(&self.config)?,
    };

    Ok(Profiler::from_parts(self.config, suspender))
  }

  #[must_use]
  pub fn initial_site_capacity(mut self, capacity: usize) -> Self {
    self.config.initial_site_capacity = capacity;
    self
  }

  #[must_use]
  pub fn max_stack_depth(mut self, depth: u16) -> Self {
    self.config.max_stack_depth = depth;
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn print_stats(mut self, enabled: bool) -> Self {
    self.config.print_stats = enabled;
    self
  }

  #[must_use]
  pub fn quarantine_bytes(mut self, bytes: usize) -> Self {
    self.config.quarantine_bytes = bytes;
    self
  }

  #[cfg(unix)]
  #[must_use]
  pub fn suspend_signal(mut self, signal: libc::c_int) -> Self {
    self.config.suspend_signal = signal;
    self
  }

  #[must_use]
  pub fn suspend_timeout(mut self, timeout: Duration) -> Self {
    self.config.suspend_timeout = timeout;
    self
  }

  /// Replace the default world suspender.
  #[must_use]
  pub fn suspender<S>(mut self, suspender: S) -> Self
  where
    S: WorldSuspender + Send + Sync + 'static,
  {
    self.suspender = Some(Box::new(suspender));
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: ProfilerConfig) -> Self {
    self.config = config;
    self
  }
}

#[cfg(unix)]
fn default_suspender(config: &ProfilerConfig) -> io::Result<BoxedSuspender> {
  let suspender =
    SignalSuspender::new(config.suspend_signal, config.suspend_timeout)?;
  Ok(Box::new(suspender))
}

#[cfg(not(unix))]
fn default_suspender(_config: &ProfilerConfig) -> io::Result<BoxedSuspender> {
  warn!("no world suspender for this platform; other threads keep running");
  Ok(Box::new(PassthroughSuspender))
}

struct ProfilerInner {
  collector: StackCollector,
  config: ProfilerConfig,
  heap: TrackedHeap,
  suspender: BoxedSuspender,
  threads: Arc<ThreadRegistry>,
}

impl fmt::Debug for ProfilerInner {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProfilerInner")
      .field("collector", &self.collector)
      .field("config", &self.config)
      .field("heap", &self.heap)
      .field("threads", &self.threads)
      .finish_non_exhaustive()
  }
}

/// Entry point for recording heap activity and printing memory profiles.
///
/// Owns the tracked heap, the stack depot and the thread registry; a profile
/// freezes every registered thread, scans the heap and reports the largest
/// allocation sites.
#[derive(Clone, Debug)]
pub struct Profiler {
  inner: Arc<ProfilerInner>,
}

impl Profiler {
  #[must_use]
  pub fn builder() -> ProfilerBuilder {
    ProfilerBuilder::new()
  }

  #[must_use]
  pub fn config(&self) -> &ProfilerConfig {
    &self.inner.config
  }

  #[must_use]
  pub fn depot(&self) -> &Arc<StackDepot> {
    self.inner.collector.depot()
  }

  fn from_parts(config: ProfilerConfig, suspender: BoxedSuspender) -> Self {
    let depot = Arc::new(StackDepot::new());
    let inner = ProfilerInner {
      collector: StackCollector::new(depot, &config),
      heap: TrackedHeap::new(config.quarantine_bytes),
      suspender,
      threads: Arc::new(ThreadRegistry::new()),
      config,
    };

    Self {
      inner: Arc::new(inner),
    }
  }

  #[must_use]
  pub fn heap(&self) -> &TrackedHeap {
    &self.inner.heap
  }

  /// Build a profiler with the default configuration.
  ///
  /// # Errors
  ///
  /// Returns an error if the suspend signal handler cannot be installed.
  pub fn new() -> io::Result<Self> {
    ProfilerBuilder::new().finish()
  }

  /// Print the profile to stderr. Output errors are logged, not returned.
  pub fn print_memory_profile(&self, top_percent: usize, max_sites: usize) {
    let stderr = io::stderr();
    let mut out = stderr.lock();

    if let Err(err) =
      self.write_memory_profile(top_percent, max_sites, &mut out)
    {
      warn!(%err, "failed to write memory profile");
    }
  }

  /// Record a live allocation at the caller's stack.
  pub fn record_allocation(&self, size: usize) -> ChunkId {
    let site_id = self.inner.collector.capture();
    self.inner.heap.allocate(size, site_id)
  }

  /// Record a live allocation at an already captured site.
  pub fn record_allocation_at(&self, size: usize, site_id: SiteId) -> ChunkId {
    self.inner.heap.allocate(size, site_id)
  }

  /// # Errors
  ///
  /// Returns an error if the chunk was already freed or never recorded.
  pub fn record_deallocation(&self, chunk: ChunkId) -> Result<(), HeapError> {
    self.inner.heap.deallocate(chunk)
  }

  /// Record a chunk owned by the allocator itself.
  pub fn record_internal(&self, size: usize) -> ChunkId {
    self.inner.heap.allocate_internal(size)
  }

  /// Make the calling thread one that gets suspended during profiles.
  #[must_use]
  pub fn register_thread(&self) -> ThreadRegistration {
    self.inner.threads.register_current()
  }

  /// Freeze the world, scan every chunk once and return the aggregate.
  ///
  /// # Errors
  ///
  /// Returns an error if the site index cannot be reserved up front.
  pub fn take_profile(&self) -> io::Result<HeapProfile> {
    let mut profile =
      HeapProfile::with_capacity(self.inner.config.initial_site_capacity)?;

    Freezer::new(&self.inner.threads, &self.inner.heap, &*self.inner.suspender)
      .run_under_freeze(|heap| profile.scan(heap));

    let tallies = profile.tallies();
    info!(
      live_bytes = tallies.live_bytes,
      live_chunks = tallies.live_count,
      quarantined_chunks = tallies.quarantined_count,
      other_chunks = tallies.other_count,
      sites = profile.sites().len(),
      "heap scanned"
    );

    Ok(profile)
  }

  #[must_use]
  pub fn threads(&self) -> &Arc<ThreadRegistry> {
    &self.inner.threads
  }

  /// Take a profile and write the ranked report to `out`.
  ///
  /// # Panics
  ///
  /// Panics if the heap holds no live bytes.
  ///
  /// # Errors
  ///
  /// Returns an error if the index cannot be reserved or `out` fails.
  pub fn write_memory_profile(
    &self,
    top_percent: usize,
    max_sites: usize,
    out: &mut dyn Write,
  ) -> io::Result<()> {
    let mut profile = self.take_profile()?;

    render(
      &mut profile,
      &**self.depot(),
      ReportOptions::new(top_percent, max_sites),
      out,
    )?;

    if self.inner.config.print_stats {
      writeln!(out, "{}", self.inner.heap.stats())?;
      out.flush()?;
    }

    Ok(())
  }
}

static GLOBAL: OnceLock<Profiler> = OnceLock::new();

/// Make `profiler` the one used by [`print_memory_profile`].
///
/// # Errors
///
/// Hands the profiler back if one is already installed.
pub fn install(profiler: Profiler) -> Result<(), Profiler> {
  GLOBAL.set(profiler)
}

#[must_use]
pub fn installed() -> Option<&'static Profiler> {
  GLOBAL.get()
}

/// Print a memory profile of the installed profiler's heap to stderr.
///
/// Does nothing if no profiler is installed.
#[cfg(feature = "profile")]
pub fn print_memory_profile(top_percent: usize, max_sites: usize) {
  match installed() {
    Some(profiler) => profiler.print_memory_profile(top_percent, max_sites),
    None => debug!("memory profile requested with no profiler installed"),
  }
}

#[cfg(not(feature = "profile"))]
pub fn print_memory_profile(_top_percent: usize, _max_sites: usize) {}

/// C entry point for [`print_memory_profile`].
#[unsafe(no_mangle)]
pub extern "C" fn memory_profile_print(top_percent: usize, max_sites: usize) {
  print_memory_profile(top_percent, max_sites);
}

#[cfg(test)]
mod tests {
  use super::*;

  fn profiler() -> Profiler {
    Profiler::builder()
      .suspender(PassthroughSuspender)
      .initial_site_capacity(1)
      .finish()
      .expect("build profiler")
  }

  fn render_to_string(profiler: &Profiler, top: usize, max: usize) -> String {
    let mut out = Vec::new();
    profiler
      .write_memory_profile(top, max, &mut out)
      .expect("write profile");
    String::from_utf8(out).expect("utf8")
  }

  #[test]
  fn profile_reflects_recorded_heap() {
    let profiler = profiler();
    profiler.record_allocation_at(100, 7);
    profiler.record_allocation_at(50, 7);
    profiler.record_allocation_at(200, 9);
    let freed = profiler.record_allocation_at(30, 9);
    profiler.record_deallocation(freed).expect("free chunk");
    profiler.record_internal(12);

    let profile = profiler.take_profile().expect("take profile");

    assert_eq!(
      *profile.tallies(),
      Tallies {
        live_bytes: 350,
        live_count: 3,
        other_count: 1,
        quarantined_bytes: 30,
        quarantined_count: 1,
      }
    );
    assert_eq!(profile.sites().get(7).expect("site 7").total_bytes, 150);
    assert_eq!(profile.sites().get(9).expect("site 9").count, 1);
  }

  #[test]
  fn captured_stacks_are_symbolized_in_the_report() {
    let profiler = profiler();
    profiler.record_allocation(64);

    let report = render_to_string(&profiler, 100, 10);

    assert!(report.starts_with("Live Heap Allocations: 64 bytes in 1 chunks"));
    assert!(report.contains("64 byte(s) (100%) in 1 allocation(s)\n    #0 "));
  }

  #[test]
  fn stats_follow_the_report_when_enabled() {
    let profiler = Profiler::builder()
      .suspender(PassthroughSuspender)
      .print_stats(true)
      .finish()
      .expect("build profiler");
    profiler.record_allocation_at(8, 1);

    let report = render_to_string(&profiler, 100, 10);

    assert!(report.ends_with(
      "Heap stats: 1 allocation(s), 0 deallocation(s), 0 internal \
       allocation(s), 0 quarantine eviction(s)\n"
    ));
  }

  #[test]
  fn registered_threads_are_visible_until_their_guard_drops() {
    let profiler = profiler();
    let me = thread::current().id();

    let registration = profiler.register_thread();
    assert!(profiler.threads().lock().contains(me));

    drop(registration);
    assert!(profiler.threads().lock().is_empty());
  }

  #[test]
  fn configured_quarantine_bounds_the_heap() {
    let profiler = Profiler::builder()
      .with_config(ProfilerConfig::default().with_quarantine_bytes(64))
      .suspender(PassthroughSuspender)
      .finish()
      .expect("build profiler");
    let first = profiler.record_allocation_at(48, 1);
    let second = profiler.record_allocation_at(48, 2);
    profiler.record_allocation_at(8, 3);

    profiler.record_deallocation(first).expect("free first");
    profiler.record_deallocation(second).expect("free second");

    assert_eq!(profiler.config().quarantine_bytes, 64);
    assert_eq!(profiler.heap().quarantined_bytes(), 48);
    assert_eq!(profiler.heap().stats().evictions, 1);
    let profile = profiler.take_profile().expect("take profile");
    assert_eq!(profile.tallies().quarantined_count, 1);
  }

  #[test]
  fn repeated_profiles_agree() {
    let profiler = profiler();
    for site in 1..=20 {
      profiler.record_allocation_at(site as usize * 3, site);
    }

    let first = profiler.take_profile().expect("first profile");
    let second = profiler.take_profile().expect("second profile");

    assert_eq!(first.tallies(), second.tallies());
    assert_eq!(first.sites().len(), second.sites().len());
  }
}
