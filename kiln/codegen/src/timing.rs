//! Pass timing.
//!
//! Cheap scoped timers around the major phases of `convert`. Collection is
//! always on (one `Instant` read per phase boundary); the accumulated table
//! is only printed when the caller asked for it.

use std::fmt;
use std::time::{Duration, Instant};

/// The phases we account for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// Pre-scan of each function's instruction run.
    Prescan,
    /// Per-instruction lowering.
    Lower,
    /// Branch/prologue patching and EH handoff at function ends.
    Finalize,
    /// Vtables, RTTI, globals, runtime helpers, debug info.
    UnitFinalize,
    /// Object serialization and the final file write.
    Write,
}

const NUM_PASSES: usize = 5;

impl Pass {
    fn idx(self) -> usize {
        self as usize
    }

    fn describe(self) -> &'static str {
        match self {
            Pass::Prescan => "function pre-scan",
            Pass::Lower => "instruction lowering",
            Pass::Finalize => "function finalization",
            Pass::UnitFinalize => "unit finalization",
            Pass::Write => "object write",
        }
    }
}

/// Accumulated times, one slot per pass.
#[derive(Default)]
pub struct PassTimes {
    totals: [Duration; NUM_PASSES],
}

impl PassTimes {
    /// Create a zeroed table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a pass; the elapsed time is added when the returned
    /// token is passed back to [`PassTimes::end`].
    pub fn start(&self, pass: Pass) -> TimingToken {
        TimingToken {
            pass,
            started: Instant::now(),
        }
    }

    /// Stop timing and accumulate.
    pub fn end(&mut self, token: TimingToken) {
        self.totals[token.pass.idx()] += token.started.elapsed();
    }

    /// Total time of one pass.
    pub fn total(&self, pass: Pass) -> Duration {
        self.totals[pass.idx()]
    }
}

impl fmt::Display for PassTimes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "======== ========  ==================================")?;
        writeln!(f, "   Total     Pass")?;
        writeln!(f, "-------- --------  ----------------------------------")?;
        for pass in [
            Pass::Prescan,
            Pass::Lower,
            Pass::Finalize,
            Pass::UnitFinalize,
            Pass::Write,
        ] {
            let t = self.totals[pass.idx()];
            writeln!(
                f,
                "{:4}.{:03}           {}",
                t.as_secs(),
                t.subsec_millis(),
                pass.describe()
            )?;
        }
        writeln!(f, "======== ========  ==================================")
    }
}

/// An in-flight timer; see [`PassTimes::start`].
pub struct TimingToken {
    pass: Pass,
    started: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_pass() {
        let mut times = PassTimes::new();
        let t = times.start(Pass::Lower);
        times.end(t);
        assert!(times.total(Pass::Lower) >= Duration::ZERO);
        assert_eq!(times.total(Pass::Write), Duration::ZERO);
        let _ = format!("{times}");
    }
}
