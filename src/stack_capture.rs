use super::*;

/// Captures native stacks at allocation time and interns them in the depot.
#[derive(Debug)]
pub struct StackCollector {
  depot: Arc<StackDepot>,
  max_depth: usize,
  skip_frames: usize,
}

impl StackCollector {
  /// Capture the calling stack and return its site id.
  #[must_use]
  pub fn capture(&self) -> SiteId {
    let mut frames = self.capture_frames();

    if frames.is_empty() {
      frames.push(FrameMetadata::new("<unknown>", "<unknown>", 0));
    }

    self.depot.intern(frames)
  }

  fn capture_frames(&self) -> Vec<FrameMetadata> {
    let mut frames = Vec::with_capacity(self.max_depth);
    let mut remaining_skip = self.skip_frames;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if frames.len() >= self.max_depth {
        return false;
      }

      frames.push(extract_metadata(frame));
      true
    });

    frames
  }

  #[must_use]
  pub fn depot(&self) -> &Arc<StackDepot> {
    &self.depot
  }

  #[must_use]
  pub fn new(depot: Arc<StackDepot>, config: &ProfilerConfig) -> Self {
    Self {
      depot,
      max_depth: usize::from(config.max_stack_depth.max(1)),
      skip_frames: config.native_skip_frames,
    }
  }
}

fn extract_metadata(frame: &Frame) -> FrameMetadata {
  let mut filename = None;
  let mut function = None;
  let mut lineno = None;

  backtrace::resolve_frame(frame, |symbol| {
    if filename.is_none() {
      filename = symbol
        .filename()
        .and_then(path_to_string)
        .map(str::to_string);
    }

    if function.is_none() {
      function = symbol.name().map(|name| symbol_name_to_string(&name));
    }

    if lineno.is_none() {
      lineno = symbol.lineno();
    }
  });

  FrameMetadata::new(
    filename.unwrap_or_else(|| format!("{:p}", frame.ip())),
    function.unwrap_or_else(|| "<unknown>".to_string()),
    lineno.unwrap_or(0),
  )
}

fn path_to_string(path: &std::path::Path) -> Option<&str> {
  path
    .to_str()
    .or_else(|| path.file_name().and_then(OsStr::to_str))
}

fn symbol_name_to_string(name: &SymbolName<'_>) -> String {
  format!("{name:#}")
}
