use serde::Serialize;
use std::time::{Duration, Instant};

/// Rolling performance counters of one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timings {
    pub t_start_ms: f64,
    pub t_end_ms: f64,
    pub t_load_ms: f64,
    pub t_sample_ms: f64,
    pub t_p_eval_ms: f64,
    pub t_eval_ms: f64,
    pub n_sample: u64,
    pub n_p_eval: u64,
    pub n_eval: u64,
}

impl Timings {
    fn per_second(n: u64, ms: f64) -> f64 {
        if ms <= 0.0 { 0.0 } else { n as f64 * 1000.0 / ms }
    }

    pub fn prompt_tokens_per_second(&self) -> f64 {
        Self::per_second(self.n_p_eval, self.t_p_eval_ms)
    }

    pub fn eval_tokens_per_second(&self) -> f64 {
        Self::per_second(self.n_eval, self.t_eval_ms)
    }

    pub fn summary(&self) -> String {
        format!(
            "load {:.2} ms | sample {:.2} ms / {} runs | prompt eval {:.2} ms / {} tokens ({:.2} tok/s) | eval {:.2} ms / {} runs ({:.2} tok/s)",
            self.t_load_ms,
            self.t_sample_ms,
            self.n_sample,
            self.t_p_eval_ms,
            self.n_p_eval,
            self.prompt_tokens_per_second(),
            self.t_eval_ms,
            self.n_eval,
            self.eval_tokens_per_second(),
        )
    }
}

/// Counters plus the clock they are measured against.
#[derive(Debug, Clone)]
pub(crate) struct PerfCounters {
    epoch: Instant,
    disabled: bool,
    t: Timings,
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl PerfCounters {
    pub(crate) fn new(disabled: bool, load: Duration) -> Self {
        let mut t = Timings::default();
        t.t_load_ms = ms(load);
        Self {
            epoch: Instant::now(),
            disabled,
            t,
        }
    }

    /// A decode of more than one token counts as prompt evaluation.
    pub(crate) fn record_decode(&mut self, n_tokens: usize, elapsed: Duration) {
        if self.disabled {
            return;
        }
        if n_tokens > 1 {
            self.t.t_p_eval_ms += ms(elapsed);
            self.t.n_p_eval += n_tokens as u64;
        } else {
            self.t.t_eval_ms += ms(elapsed);
            self.t.n_eval += 1;
        }
    }

    pub(crate) fn record_sample(&mut self, elapsed: Duration) {
        if self.disabled {
            return;
        }
        self.t.t_sample_ms += ms(elapsed);
        self.t.n_sample += 1;
    }

    pub(crate) fn snapshot(&self) -> Timings {
        let mut t = self.t;
        t.t_end_ms = ms(self.epoch.elapsed());
        t
    }

    /// Zero the counters; load time is kept.
    pub(crate) fn reset(&mut self) {
        let load = self.t.t_load_ms;
        self.t = Timings {
            t_load_ms: load,
            ..Timings::default()
        };
        self.t.t_start_ms = ms(self.epoch.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_and_eval_are_split_by_batch_size() {
        let mut p = PerfCounters::new(false, Duration::from_millis(5));
        p.record_decode(8, Duration::from_millis(4));
        p.record_decode(1, Duration::from_millis(2));
        p.record_sample(Duration::from_millis(1));
        let t = p.snapshot();
        assert_eq!(t.n_p_eval, 8);
        assert_eq!(t.n_eval, 1);
        assert_eq!(t.n_sample, 1);
        assert!((t.prompt_tokens_per_second() - 2000.0).abs() < 1.0);

        p.reset();
        let t = p.snapshot();
        assert_eq!(t.n_p_eval, 0);
        assert!(t.t_load_ms >= 5.0);
    }

    #[test]
    fn disabled_counters_stay_zero() {
        let mut p = PerfCounters::new(true, Duration::ZERO);
        p.record_decode(3, Duration::from_millis(1));
        p.record_sample(Duration::from_millis(1));
        assert_eq!(p.snapshot().n_p_eval, 0);
        assert_eq!(p.snapshot().n_sample, 0);
    }
}
