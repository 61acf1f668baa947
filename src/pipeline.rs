//! Line pipeline: turns raw file bytes into a bounded rate of messages.
//!
//! Bytes flow through three stages:
//!
//! - **split**: bytes accumulate into the current line until a `\n` or until
//!   the line reaches [`MAX_LINE_LEN`];
//! - **dedup**: a completed line equal to the previous one only bumps a
//!   repeat counter; runs are summarised as `previous message repeated N
//!   times`;
//! - **rate limit**: a leaky bucket admits at most `limit` messages whose
//!   slots have not yet expired; the rest are counted and later announced
//!   with `suppressed N messages`.
//!
//! The pipeline is plain data: callers pass the current [`Instant`] and a
//! sink closure, which keeps it deterministic under test.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Maximum length of one line; longer lines are split.
pub const MAX_LINE_LEN: usize = 1024;

/// Counters kept by a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    /// Complete lines extracted from the byte stream
    pub lines: u64,

    /// Messages handed to the sink (including notices)
    pub emitted: u64,

    /// Lines collapsed because they repeated the previous line
    pub duplicates: u64,

    /// Messages dropped by the rate limiter
    pub suppressed: u64,
}

/// Outcome of asking the rate limiter for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The message may go out. `suppressed` is the number of messages that
    /// were dropped since the last admission and must be announced first.
    Admitted { suppressed: u64 },

    /// The window is full; the message was counted and must be dropped.
    Suppressed,
}

/// Leaky-bucket rate limiter.
///
/// Each admitted message occupies a slot that expires `window` after it was
/// taken. Slots expire independently, so the budget refills gradually rather
/// than at fixed boundaries.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    slots: VecDeque<Instant>,
    suppressed: u64,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            slots: VecDeque::new(),
            suppressed: 0,
        }
    }

    /// Check for room at `now`. An admission resets the suppressed count.
    pub fn admit(&mut self, now: Instant) -> Admission {
        self.expire(now);

        if self.slots.len() >= self.limit {
            self.suppressed += 1;
            return Admission::Suppressed;
        }

        Admission::Admitted {
            suppressed: std::mem::take(&mut self.suppressed),
        }
    }

    /// Occupy one slot starting at `now`.
    pub fn take_slot(&mut self, now: Instant) {
        self.slots.push_back(now + self.window);
    }

    /// Number of slots currently occupied.
    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.slots.len()
    }

    /// Messages dropped since the last admission.
    #[cfg(test)]
    fn pending_suppressed(&self) -> u64 {
        self.suppressed
    }

    fn expire(&mut self, now: Instant) {
        while let Some(expiry) = self.slots.front() {
            if *expiry > now {
                break;
            }
            self.slots.pop_front();
        }
    }
}

/// Per-stream line pipeline.
#[derive(Debug)]
pub struct LinePipeline {
    /// Two line buffers; `current` selects the one being filled, the other
    /// holds the previously completed line.
    lines: [Vec<u8>; 2],
    current: usize,
    has_previous: bool,
    repeats: u64,
    repeat_threshold: u64,
    limiter: RateLimiter,
    counters: PipelineCounters,
}

impl LinePipeline {
    pub fn new(rate_limit: u32, rate_window: Duration, repeat_threshold: u32) -> Self {
        Self {
            lines: [
                Vec::with_capacity(MAX_LINE_LEN),
                Vec::with_capacity(MAX_LINE_LEN),
            ],
            current: 0,
            has_previous: false,
            repeats: 0,
            repeat_threshold: u64::from(repeat_threshold.max(1)),
            limiter: RateLimiter::new(rate_limit, rate_window),
            counters: PipelineCounters::default(),
        }
    }

    /// Feed a chunk of file content. Every message that survives dedup and
    /// rate limiting is passed to `sink`, in order.
    pub fn feed<F>(&mut self, chunk: &[u8], now: Instant, sink: &mut F)
    where
        F: FnMut(&[u8]),
    {
        for &byte in chunk {
            if byte == b'\n' {
                self.complete_line(now, sink);
                continue;
            }
            if self.lines[self.current].len() >= MAX_LINE_LEN {
                self.complete_line(now, sink);
            }
            self.lines[self.current].push(byte);
        }
    }

    /// Forget the partially accumulated line and flush any pending repeat
    /// run, so the next bytes are treated like the start of a fresh file.
    pub fn restart<F>(&mut self, now: Instant, sink: &mut F)
    where
        F: FnMut(&[u8]),
    {
        self.flush_repeats(now, sink);
        self.repeats = 0;
        self.has_previous = false;
        self.lines[0].clear();
        self.lines[1].clear();
        self.current = 0;
    }

    /// Bytes of the line still being accumulated.
    pub fn partial_len(&self) -> usize {
        self.lines[self.current].len()
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    fn complete_line<F>(&mut self, now: Instant, sink: &mut F)
    where
        F: FnMut(&[u8]),
    {
        self.counters.lines += 1;
        let previous = 1 - self.current;

        if self.has_previous && self.lines[self.current] == self.lines[previous] {
            self.repeats += 1;
            self.counters.duplicates += 1;
            self.lines[self.current].clear();

            if self.repeats % self.repeat_threshold == 0 {
                let notice = repeated_notice(self.repeats);
                self.rate_limited(now, notice.as_bytes(), sink);
            }
            return;
        }

        self.flush_repeats(now, sink);

        let line = std::mem::take(&mut self.lines[self.current]);
        self.rate_limited(now, &line, sink);
        self.lines[self.current] = line;

        self.repeats = 0;
        self.has_previous = true;
        self.current = previous;
        self.lines[self.current].clear();
    }

    /// Emit whatever the previous line's repeat run owes: the line itself if
    /// it repeated once, a summary if it repeated more.
    fn flush_repeats<F>(&mut self, now: Instant, sink: &mut F)
    where
        F: FnMut(&[u8]),
    {
        match self.repeats {
            0 => {}
            1 => {
                let previous = 1 - self.current;
                let line = std::mem::take(&mut self.lines[previous]);
                self.rate_limited(now, &line, sink);
                self.lines[previous] = line;
            }
            n => {
                let notice = repeated_notice(n);
                self.rate_limited(now, notice.as_bytes(), sink);
            }
        }
    }

    fn rate_limited<F>(&mut self, now: Instant, body: &[u8], sink: &mut F)
    where
        F: FnMut(&[u8]),
    {
        match self.limiter.admit(now) {
            Admission::Suppressed => {
                self.counters.suppressed += 1;
            }
            Admission::Admitted { suppressed } => {
                if suppressed > 0 {
                    self.limiter.take_slot(now);
                    self.counters.emitted += 1;
                    sink(suppressed_notice(suppressed).as_bytes());
                }
                self.limiter.take_slot(now);
                self.counters.emitted += 1;
                sink(body);
            }
        }
    }
}

/// Body of the notice summarising a run of duplicate lines.
pub fn repeated_notice(count: u64) -> String {
    format!("previous message repeated {} times", count)
}

/// Body of the notice announcing messages dropped by the rate limiter.
pub fn suppressed_notice(count: u64) -> String {
    format!("suppressed {} messages", count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1000);

    fn unthrottled() -> LinePipeline {
        LinePipeline::new(u32::MAX, WINDOW, 500)
    }

    fn run(pipeline: &mut LinePipeline, chunk: &[u8], now: Instant) -> Vec<String> {
        let mut out = Vec::new();
        pipeline.feed(chunk, now, &mut |body: &[u8]| {
            out.push(String::from_utf8_lossy(body).into_owned())
        });
        out
    }

    #[test]
    fn test_distinct_lines_pass_in_order() {
        let mut pipeline = unthrottled();
        let out = run(&mut pipeline, b"one\ntwo\nthree\n", Instant::now());
        assert_eq!(out, vec!["one", "two", "three"]);
        assert_eq!(pipeline.counters().lines, 3);
    }

    #[test]
    fn test_partial_line_waits_for_terminator() {
        let mut pipeline = unthrottled();
        let now = Instant::now();
        assert!(run(&mut pipeline, b"hel", now).is_empty());
        assert_eq!(pipeline.partial_len(), 3);
        assert_eq!(run(&mut pipeline, b"lo\n", now), vec!["hello"]);
        assert_eq!(pipeline.partial_len(), 0);
    }

    #[test]
    fn test_single_repeat_flushed_verbatim() {
        let mut pipeline = unthrottled();
        let out = run(&mut pipeline, b"a\na\nb\n", Instant::now());
        assert_eq!(out, vec!["a", "a", "b"]);
        assert_eq!(pipeline.counters().duplicates, 1);
    }

    #[test]
    fn test_multiple_repeats_summarised() {
        let mut pipeline = unthrottled();
        let out = run(&mut pipeline, b"a\na\na\na\nb\n", Instant::now());
        assert_eq!(
            out,
            vec!["a", "previous message repeated 3 times", "b"]
        );
    }

    #[test]
    fn test_threshold_notice_mid_run() {
        let mut pipeline = unthrottled();
        let mut input = b"a\n".repeat(501);
        input.extend_from_slice(b"b\n");

        let out = run(&mut pipeline, &input, Instant::now());
        assert_eq!(
            out,
            vec![
                "a",
                "previous message repeated 500 times",
                "previous message repeated 500 times",
                "b",
            ]
        );
    }

    #[test]
    fn test_threshold_does_not_reset_counter() {
        let mut pipeline = LinePipeline::new(u32::MAX, WINDOW, 2);
        let out = run(&mut pipeline, b"x\nx\nx\nx\nx\ny\n", Instant::now());
        assert_eq!(
            out,
            vec![
                "x",
                "previous message repeated 2 times",
                "previous message repeated 4 times",
                "previous message repeated 4 times",
                "y",
            ]
        );
    }

    #[test]
    fn test_repeat_run_spanning_chunks() {
        let mut pipeline = unthrottled();
        let now = Instant::now();
        assert_eq!(run(&mut pipeline, b"a\na", now), vec!["a"]);
        assert!(run(&mut pipeline, b"\na\n", now).is_empty());
        assert_eq!(
            run(&mut pipeline, b"c\n", now),
            vec!["previous message repeated 2 times", "c"]
        );
    }

    #[test]
    fn test_long_line_split_without_losing_bytes() {
        let mut pipeline = unthrottled();
        let mut input = vec![b'x'; MAX_LINE_LEN + 6];
        input.push(b'\n');

        let out = run(&mut pipeline, &input, Instant::now());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), MAX_LINE_LEN);
        assert_eq!(out[1], "xxxxxx");
    }

    #[test]
    fn test_rate_limit_suppresses_excess() {
        let mut pipeline = LinePipeline::new(3, WINDOW, 500);
        let start = Instant::now();

        let out = run(&mut pipeline, b"1\n2\n3\n4\n5\n", start);
        assert_eq!(out, vec!["1", "2", "3"]);
        assert_eq!(pipeline.counters().suppressed, 2);

        let out = run(&mut pipeline, b"6\n", start + WINDOW);
        assert_eq!(out, vec!["suppressed 2 messages", "6"]);
    }

    #[test]
    fn test_suppressed_notice_counts_against_limit() {
        let mut pipeline = LinePipeline::new(2, WINDOW, 500);
        let start = Instant::now();

        run(&mut pipeline, b"1\n2\n3\n", start);
        let out = run(&mut pipeline, b"4\n5\n", start + WINDOW);
        // notice and "4" use both slots, "5" is suppressed again
        assert_eq!(out, vec!["suppressed 1 messages", "4"]);
        assert_eq!(pipeline.counters().suppressed, 2);
    }

    #[test]
    fn test_leaky_bucket_slots_expire_independently() {
        let mut limiter = RateLimiter::new(2, WINDOW);
        let start = Instant::now();

        assert_eq!(limiter.admit(start), Admission::Admitted { suppressed: 0 });
        limiter.take_slot(start);

        let later = start + Duration::from_millis(400);
        assert_eq!(limiter.admit(later), Admission::Admitted { suppressed: 0 });
        limiter.take_slot(later);

        assert_eq!(limiter.admit(later), Admission::Suppressed);

        // first slot frees at start + 1000, second at start + 1400
        let first_free = start + WINDOW;
        assert_eq!(limiter.admit(first_free), Admission::Admitted { suppressed: 1 });
        limiter.take_slot(first_free);
        assert_eq!(limiter.admit(first_free), Admission::Suppressed);
        assert_eq!(limiter.in_use(), 2);
        assert_eq!(limiter.pending_suppressed(), 1);
    }

    #[test]
    fn test_restart_replays_like_initial_read() {
        let content = b"a\na\na\nb\nb\n";
        let start = Instant::now();

        let mut fresh = unthrottled();
        let initial = run(&mut fresh, content, start);

        let mut replayed = unthrottled();
        run(&mut replayed, content, start);
        run(&mut replayed, b"partial", start);
        let mut flushed = Vec::new();
        replayed.restart(start, &mut |body: &[u8]| {
            flushed.push(String::from_utf8_lossy(body).into_owned())
        });
        assert_eq!(flushed, vec!["b"]);
        assert_eq!(replayed.partial_len(), 0);

        assert_eq!(run(&mut replayed, content, start), initial);
    }

    #[test]
    fn test_empty_lines_are_deduplicated() {
        let mut pipeline = unthrottled();
        let out = run(&mut pipeline, b"\n\n\nz\n", Instant::now());
        assert_eq!(out, vec!["", "previous message repeated 2 times", "z"]);
    }
}
