#![deny(unsafe_op_in_unsafe_fn)]

// SPDX-FileCopyrightText: 2021 Guillaume DIDIER
//
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::fmt::Debug;

use step_utils::pagetable::{
    accessed, execute_disabled, mark_executable, mark_execute_disable, mark_not_accessed, present,
    PageTableLevel,
};

/// Origin of the event that interrupts the monitored context.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrapKind {
    /// Synchronous software interrupt raised by the controller itself.
    Software,
    /// One-shot local timer interrupt armed before resuming.
    Timer,
    /// Protection fault provoked by an execute-disabled code page.
    Fault,
}

pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Hardware-saved state made available to the handler when a trap fires.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TrapFrame {
    pub vector: u8,
    /// Saved code segment selector; the low bits carry the interrupted
    /// privilege level.
    pub cs: u16,
    /// Saved RFLAGS, notably the interrupt-enable bit.
    pub flags: u64,
    /// Instruction pointer the monitored context will resume at.
    pub resume_address: u64,
    /// Cycle counter sampled in the handler, as close to the asynchronous
    /// exit as the handler entry path allows.
    pub tsc_aex: u64,
}

/// Result of handing control to the monitored context.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrapOutcome {
    Trapped(TrapFrame),
    /// The monitored region ran to completion without trapping.
    Completed,
}

#[derive(Debug)]
pub enum SetupError {
    Affinity(nix::Error),
    HandlerInstall(u8),
    TimerProgramming,
    EntryNotPresent(u64),
    NoWatchedEntry(PageTableLevel),
}

#[derive(Debug)]
pub enum SteppingError {
    Setup(SetupError),
    /// A trap fired for a reason other than the armed watched condition.
    /// Continuing would execute the monitored context with unknown
    /// protection state.
    UnexpectedTrap { vector: u8, resume_address: u64 },
    /// The fault handler's restoration is not taking effect.
    FaultLoopExceeded { recoveries: u32 },
}

impl From<SetupError> for SteppingError {
    fn from(e: SetupError) -> Self {
        SteppingError::Setup(e)
    }
}

/// A live page-table entry the controller has marked. The raw value is shared
/// with the address-translation hardware; mutations must take effect for
/// subsequent translations.
pub trait WatchedEntry {
    fn raw(&self) -> u64;
    fn set_raw(&mut self, value: u64);

    fn mark_execute_disable(&mut self) {
        self.set_raw(mark_execute_disable(self.raw()));
    }
    fn mark_executable(&mut self) {
        self.set_raw(mark_executable(self.raw()));
    }
    fn clear_accessed(&mut self) {
        self.set_raw(mark_not_accessed(self.raw()));
    }
    fn accessed(&self) -> bool {
        accessed(self.raw())
    }
    fn present(&self) -> bool {
        present(self.raw())
    }
    fn execute_disabled(&self) -> bool {
        execute_disabled(self.raw())
    }
}

/// Entry reference backed by a remapped live page table.
#[derive(Debug)]
pub struct RawEntryRef {
    entry: *mut u64,
}

impl RawEntryRef {
    /// # Safety
    ///
    /// `entry` must point to a mapped page-table entry that stays valid for
    /// the lifetime of this reference, and no other software actor may mutate
    /// it during a run.
    pub unsafe fn new(entry: *mut u64) -> RawEntryRef {
        RawEntryRef { entry }
    }
}

impl WatchedEntry for RawEntryRef {
    fn raw(&self) -> u64 {
        unsafe { self.entry.read_volatile() }
    }

    fn set_raw(&mut self, value: u64) {
        unsafe { self.entry.write_volatile(value) }
    }
}

/// Privileged primitives the step controller drives. Real implementations
/// wrap a kernel helper library (interrupt descriptor setup, local timer
/// reprogramming, page-table remapping); the simulation backend scripts them.
pub trait SteppingBackend: Debug {
    /// Registers the controller's handler on `vector`.
    fn install_irq_handler(&mut self, vector: u8) -> Result<(), SetupError>;

    /// Remaps and retains the entry backing `virtual_address` at `level`.
    fn watch_entry(&mut self, virtual_address: u64, level: PageTableLevel)
        -> Result<(), SetupError>;
    fn entry(&mut self, level: PageTableLevel) -> Option<&mut dyn WatchedEntry>;

    fn timer_oneshot_setup(&mut self, vector: u8) -> Result<(), SetupError>;
    /// Arms the timer to fire no sooner than `ticks` device ticks from now.
    fn timer_arm_after(&mut self, ticks: u32);
    fn timer_disarm(&mut self);

    /// Queues a synchronous software interrupt for the next resume.
    fn raise_irq(&mut self, vector: u8);

    /// Entry point of the monitored code region (the address whose mapping is
    /// watched).
    fn monitored_entry_address(&self) -> u64;
    fn current_privilege(&self) -> u8;
    fn read_flags(&self) -> u64;

    /// Whether an armed interrupt has fired without its frame having been
    /// consumed yet (late delivery on the timer path).
    fn irq_pending(&self) -> bool;
    fn take_late_frame(&mut self) -> Option<TrapFrame>;

    /// Hands control to the monitored context until it traps or completes.
    fn resume_monitored(&mut self) -> TrapOutcome;
    /// Monotonic cycle counter on the stepping core.
    fn timestamp(&mut self) -> u64;
}

pub fn restore_affinity(cpu_set: &CpuSet) -> Result<(), SetupError> {
    sched_setaffinity(Pid::from_raw(0), cpu_set).map_err(SetupError::Affinity)
}

/// Pins the calling thread to a single core for the duration of a run.
#[must_use = "This result must be used to restore affinity"]
pub fn pin_to_core(core: usize) -> Result<CpuSet, SetupError> {
    let old = sched_getaffinity(Pid::from_raw(0)).map_err(SetupError::Affinity)?;
    let mut set = CpuSet::new();
    set.set(core).map_err(SetupError::Affinity)?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(SetupError::Affinity)?;
    Ok(old)
}
