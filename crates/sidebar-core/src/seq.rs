//! Patch stream progress tracking.
//!
//! Every patch batch carries a monotonic `seq`. The tracker remembers the
//! highest one applied, flags gaps, and decides after a bootstrap whose
//! counter is authoritative.

use serde_json::Value;

/// Decode an external sequence number.
///
/// Total: anything missing, non-numeric, negative or non-finite becomes `0`;
/// fractions are floored. Numeric strings are accepted.
pub fn normalize_seq(raw: Option<&Value>) -> u64 {
    let value = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => v.floor() as u64,
        _ => 0,
    }
}

/// Fold a bootstrap counter into the current one. A missing bootstrap value
/// carries no information.
pub fn merge_baseline(current: u64, bootstrap_seq: Option<u64>) -> u64 {
    match bootstrap_seq {
        Some(seq) => current.max(seq),
        None => current,
    }
}

/// Inputs to [`resolve_after_bootstrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapSeqInput {
    pub current_seq: u64,
    pub bootstrap_seq: Option<u64>,
    pub out_of_sync: bool,
    pub saw_reset: bool,
}

/// Pick the counter to continue from after a bootstrap.
///
/// After a hard reset the old counter belongs to a discarded timeline, so the
/// bootstrap value wins even when it is smaller. An ordinary gap never
/// regresses progress.
pub fn resolve_after_bootstrap(input: BootstrapSeqInput) -> u64 {
    if input.saw_reset {
        return input.bootstrap_seq.unwrap_or(0);
    }
    merge_baseline(input.current_seq, input.bootstrap_seq)
}

/// What to do with an incoming batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqDecision {
    /// Next in line (or unsequenced); apply it.
    Apply,
    /// Already seen; skip.
    Stale,
    /// One or more batches were missed. Apply it, then bootstrap.
    Gap,
    /// The server started a new timeline. Bootstrap before trusting state.
    Reset,
}

#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    seq: u64,
    out_of_sync: bool,
    saw_reset: bool,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.seq
    }

    pub fn needs_bootstrap(&self) -> bool {
        self.out_of_sync || self.saw_reset
    }

    pub fn saw_reset(&self) -> bool {
        self.saw_reset
    }

    /// Classify a batch and advance the counter.
    ///
    /// A `seq` of `0` means the sender does not sequence this stream; such
    /// batches are always applied and leave the counter alone.
    pub fn observe(&mut self, batch_seq: u64, reset: bool) -> SeqDecision {
        if reset {
            tracing::info!("Patch stream reset at seq {}", batch_seq);
            self.saw_reset = true;
            self.out_of_sync = true;
            return SeqDecision::Reset;
        }
        if batch_seq == 0 {
            return SeqDecision::Apply;
        }
        if batch_seq <= self.seq {
            tracing::debug!("Stale patch batch {} (current {})", batch_seq, self.seq);
            return SeqDecision::Stale;
        }
        let gap = self.seq > 0 && batch_seq > self.seq + 1;
        self.seq = batch_seq;
        if gap {
            tracing::info!("Patch stream gap at seq {}", batch_seq);
            self.out_of_sync = true;
            return SeqDecision::Gap;
        }
        SeqDecision::Apply
    }

    /// Mark the stream as out of sync (replay-gap frame, reconnect).
    pub fn mark_out_of_sync(&mut self) {
        self.out_of_sync = true;
    }

    /// Settle after a bootstrap and clear the sync flags.
    pub fn complete_bootstrap(&mut self, bootstrap_seq: Option<u64>) -> u64 {
        self.seq = resolve_after_bootstrap(BootstrapSeqInput {
            current_seq: self.seq,
            bootstrap_seq,
            out_of_sync: self.out_of_sync,
            saw_reset: self.saw_reset,
        });
        self.out_of_sync = false;
        self.saw_reset = false;
        self.seq
    }
}
