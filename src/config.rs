use super::*;

/// Controls how the profiler reserves memory, captures stacks and freezes
/// the world.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
  /// Allocation sites reserved before the world is frozen.
  pub initial_site_capacity: usize,
  /// Maximum number of native frames captured per allocation.
  pub max_stack_depth: u16,
  /// Innermost frames dropped from every capture (the profiler's own).
  pub native_skip_frames: usize,
  /// Append allocator statistics after each report.
  pub print_stats: bool,
  /// Bytes of freed chunks held in quarantine before the oldest are evicted.
  pub quarantine_bytes: usize,
  /// Signal used to park registered threads.
  #[cfg(unix)]
  pub suspend_signal: libc::c_int,
  /// How long to wait for registered threads to park before giving up.
  pub suspend_timeout: Duration,
}

impl Default for ProfilerConfig {
  fn default() -> Self {
    Self {
      initial_site_capacity: 1024,
      max_stack_depth: 16,
      native_skip_frames: 3,
      print_stats: false,
      quarantine_bytes: 256 * 1024,
      #[cfg(unix)]
      suspend_signal: libc::SIGUSR2,
      suspend_timeout: Duration::from_secs(10),
    }
  }
}

impl ProfilerConfig {
  /// Builder-style helper to adjust the maximum stack depth.
  #[must_use]
  pub fn with_max_stack_depth(mut self, depth: u16) -> Self {
    self.max_stack_depth = depth;
    self
  }

  #[must_use]
  pub fn with_quarantine_bytes(mut self, bytes: usize) -> Self {
    self.quarantine_bytes = bytes;
    self
  }
}
