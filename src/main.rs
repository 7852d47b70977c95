use {
  memory_profile::{ChunkId, Profiler},
  std::{
    io,
    sync::{
      Arc, Barrier,
      atomic::{AtomicBool, Ordering},
    },
    thread,
  },
  tracing_subscriber::EnvFilter,
};

#[inline(never)]
fn load_textures(profiler: &Profiler) -> Vec<ChunkId> {
  (0..4).map(|_| profiler.record_allocation(64 * 1024)).collect()
}

#[inline(never)]
fn parse_config(profiler: &Profiler) -> ChunkId {
  profiler.record_allocation(2 * 1024)
}

#[inline(never)]
fn scratch_buffer(profiler: &Profiler) -> ChunkId {
  profiler.record_allocation(16 * 1024)
}

fn main() -> io::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(io::stderr)
    .init();

  let profiler = Profiler::builder().print_stats(true).finish()?;
  let _main = profiler.register_thread();

  let stop = Arc::new(AtomicBool::new(false));
  let ready = Arc::new(Barrier::new(3));

  let workers: Vec<_> = (0..2)
    .map(|_| {
      let profiler = profiler.clone();
      let stop = Arc::clone(&stop);
      let ready = Arc::clone(&ready);

      thread::spawn(move || {
        let _registration = profiler.register_thread();
        load_textures(&profiler);
        ready.wait();

        while !stop.load(Ordering::Acquire) {
          thread::yield_now();
        }
      })
    })
    .collect();

  parse_config(&profiler);
  for _ in 0..3 {
    let chunk = scratch_buffer(&profiler);
    if let Err(err) = profiler.record_deallocation(chunk) {
      eprintln!("demo: {err}");
    }
  }
  profiler.record_internal(4096);

  ready.wait();

  if memory_profile::install(profiler.clone()).is_err() {
    eprintln!("demo: a profiler was already installed");
  }
  memory_profile::print_memory_profile(90, 5);

  let profile = profiler.take_profile()?;
  profile
    .export_json(io::stdout().lock())
    .map_err(io::Error::other)?;
  println!();

  stop.store(true, Ordering::Release);
  for worker in workers {
    if worker.join().is_err() {
      eprintln!("demo: worker panicked");
    }
  }

  Ok(())
}
