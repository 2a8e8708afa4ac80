//! Flag-bit helpers mapping the spec's `P/W/U/A/C/S` onto the `x86_64`
//! crate's hardware (`PRESENT`/`WRITABLE`/`USER_ACCESSIBLE`/`ACCESSED`) and
//! software-available (`BIT_9`/`BIT_10`) page table flag bits.
//!
//! The source this was distilled from assumes a 32-bit two-level layout
//! with literal bit values `P=0x1,W=0x2,U=0x4,A=0x20,C=0x100,S=0x200`. This
//! kernel targets x86-64 long mode instead; the external interface contract
//! explicitly allows an architecture-equivalent encoding as long as the
//! flags are preserved, so `C` and `S` ride the two AVL bits the hardware
//! walker ignores rather than a hand-rolled 32-bit table format.

use x86_64::structures::paging::PageTableFlags as Flags;

/// Copy-on-write pending. Implies `!WRITABLE`.
pub const COW: Flags = Flags::BIT_9;
/// Swapped out to the backing store. Implies `!PRESENT`.
pub const SWAPPED: Flags = Flags::BIT_10;

pub const USER_RW: Flags =
    Flags::from_bits_truncate(Flags::PRESENT.bits() | Flags::WRITABLE.bits() | Flags::USER_ACCESSIBLE.bits());

pub const USER_COW: Flags =
    Flags::from_bits_truncate(Flags::PRESENT.bits() | Flags::USER_ACCESSIBLE.bits() | COW.bits());

#[inline]
pub fn is_present(flags: Flags) -> bool {
    flags.contains(Flags::PRESENT)
}

#[inline]
pub fn is_writable(flags: Flags) -> bool {
    flags.contains(Flags::WRITABLE)
}

#[inline]
pub fn is_user(flags: Flags) -> bool {
    flags.contains(Flags::USER_ACCESSIBLE)
}

#[inline]
pub fn is_accessed(flags: Flags) -> bool {
    flags.contains(Flags::ACCESSED)
}

#[inline]
pub fn is_cow(flags: Flags) -> bool {
    flags.contains(COW)
}

#[inline]
pub fn is_swapped(flags: Flags) -> bool {
    flags.contains(SWAPPED)
}

/// A present, non-CoW, non-swapped entry is the only state `map` may
/// overwrite freely; anything else present is a programming bug.
#[inline]
pub fn is_live_mapping(flags: Flags) -> bool {
    is_present(flags) && !is_cow(flags) && !is_swapped(flags)
}
