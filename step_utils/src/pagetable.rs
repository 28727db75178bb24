use static_assertions::const_assert_eq;
use x86_64::registers::rflags::RFlags;
use x86_64::structures::paging::PageTableFlags;

// The raw entry layout below is shared with the address-translation hardware.
const_assert_eq!(PageTableFlags::PRESENT.bits(), 1);
const_assert_eq!(PageTableFlags::ACCESSED.bits(), 1 << 5);
const_assert_eq!(PageTableFlags::NO_EXECUTE.bits(), 1 << 63);

/// Translation level of a remapped page-table entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum PageTableLevel {
    Pte,
    Pmd,
    Pud,
    Pgd,
}

pub fn mark_execute_disable(entry: u64) -> u64 {
    entry | PageTableFlags::NO_EXECUTE.bits()
}

pub fn mark_executable(entry: u64) -> u64 {
    entry & !PageTableFlags::NO_EXECUTE.bits()
}

pub fn mark_accessed(entry: u64) -> u64 {
    entry | PageTableFlags::ACCESSED.bits()
}

pub fn mark_not_accessed(entry: u64) -> u64 {
    entry & !PageTableFlags::ACCESSED.bits()
}

pub fn accessed(entry: u64) -> bool {
    PageTableFlags::from_bits_truncate(entry).contains(PageTableFlags::ACCESSED)
}

pub fn present(entry: u64) -> bool {
    PageTableFlags::from_bits_truncate(entry).contains(PageTableFlags::PRESENT)
}

pub fn execute_disabled(entry: u64) -> bool {
    PageTableFlags::from_bits_truncate(entry).contains(PageTableFlags::NO_EXECUTE)
}

/// Whether a saved RFLAGS value had interrupts enabled (IF set).
pub fn interrupts_enabled(flags: u64) -> bool {
    RFlags::from_bits_truncate(flags).contains(RFlags::INTERRUPT_FLAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESENT_EXEC: u64 = 0x401000 | 1;

    #[test]
    fn execute_disable_round_trip() {
        let marked = mark_execute_disable(PRESENT_EXEC);
        assert!(execute_disabled(marked));
        assert!(present(marked));
        let restored = mark_executable(marked);
        assert!(!execute_disabled(restored));
        assert_eq!(restored, PRESENT_EXEC);
    }

    #[test]
    fn accessed_bit() {
        let touched = mark_accessed(PRESENT_EXEC);
        assert!(accessed(touched));
        assert!(!accessed(mark_not_accessed(touched)));
        // clearing must not disturb the rest of the entry
        assert_eq!(mark_not_accessed(touched), PRESENT_EXEC);
    }

    #[test]
    fn not_present() {
        assert!(!present(0));
        assert!(present(PRESENT_EXEC));
    }

    #[test]
    fn interrupt_flag() {
        assert!(interrupts_enabled(0x202));
        assert!(!interrupts_enabled(0x2));
    }
}
