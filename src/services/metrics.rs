//! Terminal live-metrics display
//!
//! Repaints a single status line with the request counters and per-endpoint
//! statistics. Purely an observer: it only reads the stats handle and the
//! rotator snapshot.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use crate::models::ServerStats;
use crate::proxy::rotation::Rotator;

/// Metrics display configuration
#[derive(Clone)]
pub struct MetricsDisplayConfig {
    /// How often the line repaints
    pub refresh_interval: Duration,
    /// Hard cap on the rendered line width
    pub max_width: usize,
}

impl Default for MetricsDisplayConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(500),
            max_width: 120,
        }
    }
}

/// Renders rotator and server statistics to the terminal
pub struct MetricsDisplay {
    rotator: Arc<Rotator>,
    stats: Arc<ServerStats>,
    config: MetricsDisplayConfig,
}

impl MetricsDisplay {
    pub fn new(
        rotator: Arc<Rotator>,
        stats: Arc<ServerStats>,
        config: MetricsDisplayConfig,
    ) -> Self {
        Self {
            rotator,
            stats,
            config,
        }
    }

    /// Repaint until the shutdown signal flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.refresh_interval);

        // Hide the cursor while the line repaints in place.
        print!("\x1b[?25l");
        let _ = std::io::stdout().flush();

        loop {
            tokio::select! {
                _ = ticker.tick() => self.render(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        println!("\x1b[?25h");
        let _ = std::io::stdout().flush();
    }

    fn render(&self) {
        let line = self.render_line();
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "\r\x1b[K{}", line);
        let _ = stdout.flush();
    }

    fn render_line(&self) -> String {
        let snap = self.stats.snapshot();
        let mut line = format!(
            "[revolve] reqs:{} ok:{} fail:{} active:{}",
            snap.total_requests, snap.success_requests, snap.failed_requests, snap.active_conns
        );

        for endpoint in self.rotator.endpoints().iter() {
            line.push_str(" | ");
            let stats = endpoint.stats();
            let marker = if endpoint.is_alive() { '+' } else { '-' };
            let _ = write!(
                line,
                "{}{}[{}/{},{:.0}ms]",
                marker,
                endpoint,
                stats.requests,
                stats.failures,
                stats.avg_latency.as_secs_f64() * 1000.0
            );
        }

        clip_line(&mut line, self.config.max_width);
        line
    }
}

/// Truncate to at most `max_width` bytes without splitting a character
///
/// Non-special proxy schemes keep their hostnames un-normalized, so the line
/// may carry multi-byte text.
fn clip_line(line: &mut String, max_width: usize) {
    if line.len() <= max_width {
        return;
    }
    let mut cut = max_width.saturating_sub(3);
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line.truncate(cut);
    line.push_str("...");
}
