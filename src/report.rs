use super::*;

/// Cutoffs applied when rendering a profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReportOptions {
  /// Stop after at most this many distinct sites.
  pub max_sites: usize,
  /// Stop once the sites shown cover more than this percentage of live bytes.
  pub top_percent: usize,
}

impl ReportOptions {
  #[must_use]
  pub fn new(top_percent: usize, max_sites: usize) -> Self {
    Self {
      max_sites,
      top_percent,
    }
  }
}

/// Integer percentage of `part` in `whole`, truncated.
fn percent_of(part: usize, whole: usize) -> usize {
  let percent = (part as u128).saturating_mul(100) / whole as u128;
  usize::try_from(percent).unwrap_or(usize::MAX)
}

/// Sort the profile's sites and write the ranked report to `out`.
///
/// Each line is flushed as soon as it is written. The site that pushes the
/// cumulative share past `top_percent` is still printed.
///
/// # Panics
///
/// Panics if the profile saw no live bytes; callers must not ask for a
/// report of an empty heap.
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn render<R>(
  profile: &mut HeapProfile,
  resolver: &R,
  options: ReportOptions,
  out: &mut dyn Write,
) -> io::Result<()>
where
  R: SiteResolver + ?Sized,
{
  let tallies = *profile.tallies();
  assert!(
    tallies.live_bytes != 0,
    "memory profile requested for a heap with no live bytes"
  );

  profile.sites_mut().sort_by_size();

  writeln!(
    out,
    "Live Heap Allocations: {} bytes in {} chunks; quarantined: {} bytes in \
     {} chunks; {} other chunks; total chunks: {}; showing top {}% (at most \
     {} unique contexts)",
    tallies.live_bytes,
    tallies.live_count,
    tallies.quarantined_bytes,
    tallies.quarantined_count,
    tallies.other_count,
    tallies.total_chunks(),
    options.top_percent,
    options.max_sites
  )?;
  out.flush()?;

  let mut shown = 0usize;
  for site in profile.sites().sites().iter().take(options.max_sites) {
    writeln!(
      out,
      "{} byte(s) ({}%) in {} allocation(s)",
      site.total_bytes,
      percent_of(site.total_bytes, tallies.live_bytes),
      site.count
    )?;
    out.flush()?;

    resolver.write_trace(site.site_id, out)?;
    out.flush()?;

    shown = shown.saturating_add(site.total_bytes);
    if percent_of(shown, tallies.live_bytes) > options.top_percent {
      break;
    }
  }

  Ok(())
}
