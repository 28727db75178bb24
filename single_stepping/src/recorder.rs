use bit_field::BitField;
use step_utils::elapsed_cycles;
use trap_source::{TrapFrame, TrapKind};

/// One interruption of the monitored context. Created in the handler at fire
/// time, logged, not retained beyond run counters.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StepEvent {
    pub source: TrapKind,
    pub privilege_before: u8,
    pub privilege_after: u8,
    pub flags_snapshot: u64,
    pub cycles_elapsed: u64,
    pub resume_address: u64,
    /// Whether the watched code page was fetched since the last clear. False
    /// on a zero-step, where the interrupt arrived before the monitored
    /// instruction retired.
    pub access_observed: bool,
    pub sequence_number: u64,
}

/// Derives per-step facts from the hardware state available at event time.
/// Reads the snapshot it is given and nothing else; mutating the watched
/// entry stays with the controller, sequenced after capture.
#[derive(Debug, Default)]
pub struct EvidenceRecorder {
    next_sequence: u64,
    last_resume_address: Option<u64>,
}

impl EvidenceRecorder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of events recorded so far.
    pub fn recorded(&self) -> u64 {
        self.next_sequence
    }

    /// Builds the event for one fire. `access_bit` is the watched entry's
    /// accessed bit when one is watched; without an entry, forward progress
    /// of the resume address stands in for it.
    pub fn record(
        &mut self,
        source: TrapKind,
        frame: &TrapFrame,
        privilege_before: u8,
        tsc_begin: u64,
        access_bit: Option<bool>,
    ) -> StepEvent {
        let advanced = match self.last_resume_address {
            Some(previous) => previous != frame.resume_address,
            None => true,
        };
        let event = StepEvent {
            source,
            privilege_before,
            privilege_after: frame.cs.get_bits(0..2) as u8,
            flags_snapshot: frame.flags,
            cycles_elapsed: elapsed_cycles(tsc_begin, frame.tsc_aex),
            resume_address: frame.resume_address,
            access_observed: access_bit.unwrap_or(advanced),
            sequence_number: self.next_sequence,
        };
        self.next_sequence += 1;
        self.last_resume_address = Some(frame.resume_address);
        event
    }
}
