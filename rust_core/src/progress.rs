//! Live progress line for long runs.
//!
//! Chains report through a [`ChainProgress`] handle into shared atomic
//! counters; a separate thread polls them and redraws one line on stderr.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const BAR_WIDTH: usize = 24;
const REDRAW_EVERY: Duration = Duration::from_millis(100);

pub struct ProgressState {
    sampler: &'static str,
    iterations: usize,
    burn: usize,
    /// Iterations completed by each chain.
    chains: Vec<AtomicUsize>,
    accepted: AtomicU64,
    proposed: AtomicU64,
    divergences: AtomicUsize,
    done: AtomicBool,
    started: Instant,
}

/// Reporting handle given to one chain.
#[derive(Clone, Copy)]
pub struct ChainProgress<'a> {
    state: &'a ProgressState,
    chain: usize,
}

impl ChainProgress<'_> {
    /// One full iteration finished, with `accepted` of `proposed` moves taken.
    pub fn iteration(&self, accepted: u64, proposed: u64) {
        self.state.chains[self.chain].fetch_add(1, Ordering::Relaxed);
        self.state.accepted.fetch_add(accepted, Ordering::Relaxed);
        self.state.proposed.fetch_add(proposed, Ordering::Relaxed);
    }

    pub fn divergence(&self) {
        self.state.divergences.fetch_add(1, Ordering::Relaxed);
    }
}

impl ProgressState {
    pub fn new(sampler: &'static str, num_chains: usize, iterations: usize, burn: usize) -> Self {
        Self {
            sampler,
            iterations,
            burn,
            chains: (0..num_chains).map(|_| AtomicUsize::new(0)).collect(),
            accepted: AtomicU64::new(0),
            proposed: AtomicU64::new(0),
            divergences: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn chain(&self, chain: usize) -> ChainProgress<'_> {
        ChainProgress { state: self, chain }
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    fn completed(&self) -> usize {
        self.chains.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Iteration count of the chain furthest behind.
    fn slowest(&self) -> usize {
        self.chains
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
    }

    fn accept_rate(&self) -> Option<f64> {
        let proposed = self.proposed.load(Ordering::Relaxed);
        (proposed > 0).then(|| self.accepted.load(Ordering::Relaxed) as f64 / proposed as f64)
    }

    fn phase(&self) -> &'static str {
        if self.done.load(Ordering::Relaxed) {
            "done"
        } else if self.slowest() < self.burn {
            "burn-in"
        } else {
            "sampling"
        }
    }
}

fn abbreviate(n: f64) -> String {
    match n {
        n if n >= 1e6 => format!("{:.1}M", n / 1e6),
        n if n >= 1e4 => format!("{:.1}k", n / 1e3),
        n => format!("{:.0}", n),
    }
}

fn clock(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{}:{:02}", (secs / 60.0) as u64, (secs % 60.0) as u64)
    }
}

fn render_line(state: &ProgressState) -> String {
    let total = state.iterations * state.chains.len();
    let completed = state.completed().min(total);
    let fraction = if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    };
    let filled = (fraction * BAR_WIDTH as f64) as usize;
    let bar = "█".repeat(filled) + &"░".repeat(BAR_WIDTH - filled);

    let elapsed = state.started.elapsed().as_secs_f64();
    let mut line = format!(
        "\r{} [{}] {} {:>3.0}% {}/{} iter",
        state.sampler,
        state.phase(),
        bar,
        fraction * 100.0,
        abbreviate(completed as f64),
        abbreviate(total as f64),
    );
    if let Some(rate) = state.accept_rate() {
        line.push_str(&format!(" | accept {:.2}", rate));
    }
    let divergences = state.divergences.load(Ordering::Relaxed);
    if divergences > 0 {
        line.push_str(&format!(" | {} divergent", divergences));
    }

    if state.done.load(Ordering::Relaxed) {
        line.push_str(&format!(" | {}\x1b[K\n", clock(elapsed)));
    } else {
        let speed = if elapsed > 0.05 { completed as f64 / elapsed } else { 0.0 };
        let eta = if speed > 0.0 {
            (total - completed) as f64 / speed
        } else {
            0.0
        };
        line.push_str(&format!(
            " | {} it/s | {} < ~{}\x1b[K",
            abbreviate(speed),
            clock(elapsed),
            clock(eta)
        ));
    }
    line
}

fn draw(state: &ProgressState) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(render_line(state).as_bytes());
    let _ = err.flush();
}

/// Redraw the progress line until [`ProgressState::finish`] is called, then
/// draw the final line once more. Join the handle after finishing.
pub fn spawn_progress_thread(state: Arc<ProgressState>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !state.done.load(Ordering::Relaxed) {
            draw(&state);
            std::thread::sleep(REDRAW_EVERY);
        }
        draw(&state);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbreviations() {
        assert_eq!(abbreviate(950.0), "950");
        assert_eq!(abbreviate(20_000.0), "20.0k");
        assert_eq!(abbreviate(2_500_000.0), "2.5M");
        assert_eq!(clock(75.0), "1:15");
        assert_eq!(clock(3.0), "3.0s");
    }

    #[test]
    fn test_phase_follows_slowest_chain() {
        let state = ProgressState::new("Metropolis", 2, 100, 10);
        for _ in 0..20 {
            state.chain(0).iteration(1, 1);
        }
        assert_eq!(state.phase(), "burn-in");
        for _ in 0..10 {
            state.chain(1).iteration(0, 1);
        }
        assert_eq!(state.phase(), "sampling");
        assert_eq!(state.completed(), 30);
        assert!((state.accept_rate().unwrap() - 20.0 / 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_render_line() {
        let state = ProgressState::new("HMC", 2, 100, 50);
        assert!(!render_line(&state).contains("accept"));

        for chain in 0..2 {
            for _ in 0..50 {
                state.chain(chain).iteration(1, 2);
            }
        }
        state.chain(1).divergence();
        let line = render_line(&state);
        assert!(line.contains("[sampling]"));
        assert!(line.contains(" 50%"));
        assert!(line.contains("100/200 iter"));
        assert!(line.contains("accept 0.50"));
        assert!(line.contains("1 divergent"));
        assert!(!line.ends_with('\n'));

        state.finish();
        let line = render_line(&state);
        assert!(line.contains("[done]"));
        assert!(line.ends_with('\n'));
    }
}
