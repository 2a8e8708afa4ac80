use x86_64::structures::paging::PageTableFlags as Flags;

use crate::memory::pte;
use crate::test_runner::TestRunner;

/// Covers P3 (flag exclusivity) at the level of the pure helper functions.
pub fn run_pte_tests(runner: &mut TestRunner) {
    runner.run_test("cow_implies_not_writable_by_convention", || {
        let flags = pte::USER_COW;
        runner.assert(pte::is_cow(flags), "USER_COW should carry the CoW bit")?;
        runner.assert(!pte::is_writable(flags), "USER_COW should not carry WRITABLE")
    });

    runner.run_test("swapped_implies_not_present", || {
        let flags = pte::SWAPPED | Flags::USER_ACCESSIBLE;
        runner.assert(pte::is_swapped(flags), "flags should carry the swapped bit")?;
        runner.assert(!pte::is_present(flags), "a swapped-only entry should not carry PRESENT")
    });

    runner.run_test("live_mapping_excludes_cow_and_swapped", || {
        runner.assert(pte::is_live_mapping(pte::USER_RW), "a plain present+writable entry is a live mapping")?;
        runner.assert(!pte::is_live_mapping(pte::USER_COW), "a CoW-pending entry is not a live mapping")?;
        runner.assert(
            !pte::is_live_mapping(pte::SWAPPED | Flags::USER_ACCESSIBLE),
            "a swapped entry is not a live mapping",
        )
    });

    runner.run_test("cow_and_swapped_use_distinct_bits", || {
        runner.assert_eq(pte::COW.bits() & pte::SWAPPED.bits(), 0, "C and S must not overlap")?;
        runner.assert_eq(
            pte::COW.bits() & Flags::PRESENT.bits(),
            0,
            "the software CoW bit must not alias a hardware bit",
        )
    });
}
