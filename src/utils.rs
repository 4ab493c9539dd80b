use anyhow::{Context, Result};
use log::info;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// Byte and block totals for a run, plus the rate over a trailing window
/// (one second by default).
#[derive(Debug, Clone)]
pub struct Counter {
    pub total_size: usize,
    pub n_blocks: usize,
    pub t_begin: Instant,
    window: Duration,
    recent: VecDeque<(Instant, usize)>,
    recent_bytes: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Counter {
            total_size: 0,
            n_blocks: 0,
            t_begin: Instant::now(),
            window,
            recent: VecDeque::new(),
            recent_bytes: 0,
        }
    }

    /// MB/s since the counter was created.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_size as f64 / secs / MB
    }

    /// MB/s over the trailing window ending now.
    pub fn rate(&mut self) -> f64 {
        self.evict(Instant::now());
        self.recent_bytes as f64 / self.window.as_secs_f64().max(1e-6) / MB
    }

    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();
        self.total_size += size;
        self.n_blocks += 1;
        self.recent.push_back((now, size));
        self.recent_bytes += size;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, size)) = self.recent.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.recent.pop_front();
            self.recent_bytes -= size;
        }
    }
}

const MB: f64 = 1024.0 * 1024.0;

/// Creates `<output_dir>/camp<campaign>` if needed.
pub fn create_camp_dir(output_dir: &Path, campaign: usize) -> Result<PathBuf> {
    let path = output_dir.join(format!("camp{campaign}"));
    if !path.exists() {
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        info!("Created campaign directory {}", path.display());
    }
    Ok(path)
}

/// Picks the next run file in the campaign directory, one past the highest
/// existing `run<N>_*` entry. Returns the path and its run number.
pub fn create_run_file(output_dir: &Path, campaign: usize) -> Result<(PathBuf, usize)> {
    let camp_dir = create_camp_dir(output_dir, campaign)?;
    let max_run = std::fs::read_dir(&camp_dir)
        .with_context(|| format!("failed to list {}", camp_dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            entry.file_name().to_str().and_then(|filename| {
                let stripped = filename.strip_prefix("run")?;
                stripped.split('_').next()?.parse::<usize>().ok()
            })
        })
        .max();

    let run_num = max_run.map_or(0, |max| max + 1);
    Ok((camp_dir.join(format!("run{run_num}_0.dat")), run_num))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_totals_and_window() {
        let mut counter = Counter::new();
        counter.increment(1024 * 1024);
        counter.increment(1024 * 1024);
        assert_eq!(counter.n_blocks, 2);
        assert_eq!(counter.total_size, 2 * 1024 * 1024);
        assert!((counter.rate() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn window_rate_decays_without_new_blocks() {
        let mut counter = Counter::with_window(Duration::from_millis(20));
        counter.increment(4096);
        assert!(counter.rate() > 0.0);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.rate(), 0.0);
        assert_eq!(counter.total_size, 4096);
        assert!(counter.average_rate() > 0.0);
    }

    #[test]
    fn run_numbers_increase() {
        let dir = tempfile::tempdir().unwrap();
        let (first, n) = create_run_file(dir.path(), 3).unwrap();
        assert_eq!(n, 0);
        assert_eq!(first, dir.path().join("camp3").join("run0_0.dat"));

        std::fs::write(&first, b"").unwrap();
        std::fs::write(dir.path().join("camp3").join("run7_0.toml"), b"").unwrap();
        std::fs::write(dir.path().join("camp3").join("notes.txt"), b"").unwrap();
        let (next, n) = create_run_file(dir.path(), 3).unwrap();
        assert_eq!(n, 8);
        assert_eq!(next.file_name().unwrap(), "run8_0.dat");
    }
}
