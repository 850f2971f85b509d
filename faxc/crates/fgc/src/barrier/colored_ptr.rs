//! Colored Pointer Implementation
//!
//! A colored pointer is one machine word: the low 48 bits hold the object
//! address, bits 48..52 hold exactly one color. All bit manipulation of
//! pointer metadata lives in this module.

use std::collections::HashMap;
use std::fmt;

use crate::error::{FgcError, Result};

/// Number of address bits carried by a colored pointer
pub const ADDRESS_BITS: u32 = 48;

/// Mask selecting the address bits
pub const ADDRESS_MASK: usize = (1 << ADDRESS_BITS) - 1;

const MARKED_EVEN_MASK: usize = 1 << 48;
const MARKED_ODD_MASK: usize = 1 << 49;
const REMAPPED_MASK: usize = 1 << 50;
const FINALIZABLE_MASK: usize = 1 << 51;
const COLOR_MASK: usize = MARKED_EVEN_MASK | MARKED_ODD_MASK | REMAPPED_MASK | FINALIZABLE_MASK;

/// Pointer color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    /// Freshly stored pointer, not yet seen by a collector
    Uncolored,
    MarkedEven,
    MarkedOdd,
    /// Address is authoritative (post relocation)
    Remapped,
    /// Referent kept alive only for finalization
    Finalizable,
}

impl Color {
    pub const fn bits(self) -> usize {
        match self {
            Color::Uncolored => 0,
            Color::MarkedEven => MARKED_EVEN_MASK,
            Color::MarkedOdd => MARKED_ODD_MASK,
            Color::Remapped => REMAPPED_MASK,
            Color::Finalizable => FINALIZABLE_MASK,
        }
    }

    /// Decode color bits; `None` when more than one color is set
    pub fn from_bits(bits: usize) -> Option<Color> {
        match bits & COLOR_MASK {
            0 => Some(Color::Uncolored),
            MARKED_EVEN_MASK => Some(Color::MarkedEven),
            MARKED_ODD_MASK => Some(Color::MarkedOdd),
            REMAPPED_MASK => Some(Color::Remapped),
            FINALIZABLE_MASK => Some(Color::Finalizable),
            _ => None,
        }
    }
}

/// Cycle parity; selects which mark color is "current"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    pub fn flip(self) -> Parity {
        match self {
            Parity::Even => Parity::Odd,
            Parity::Odd => Parity::Even,
        }
    }

    pub fn mark_color(self) -> Color {
        match self {
            Parity::Even => Color::MarkedEven,
            Parity::Odd => Color::MarkedOdd,
        }
    }

    /// Parity used by collection cycle `cycle` (cycle 0 is the idle state)
    pub fn for_cycle(cycle: u64) -> Parity {
        if cycle % 2 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Parity::Even => 0,
            Parity::Odd => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Parity {
        if value == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }
}

/// Source of forwarding information consulted by healing
///
/// Implementations must resolve chains: the returned address is never itself
/// forwarded, which keeps healing idempotent.
pub trait ForwardingLookup {
    fn forwarded(&self, address: usize) -> Option<usize>;
}

/// Lookup with no forwarding entries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForwarding;

impl ForwardingLookup for NoForwarding {
    fn forwarded(&self, _address: usize) -> Option<usize> {
        None
    }
}

impl ForwardingLookup for HashMap<usize, usize> {
    fn forwarded(&self, address: usize) -> Option<usize> {
        let mut current = *self.get(&address)?;
        // Bounded walk so a malformed map cannot loop forever
        for _ in 0..self.len() {
            match self.get(&current) {
                Some(&next) if next != current => current = next,
                _ => break,
            }
        }
        Some(current)
    }
}

/// ColoredPointer - address plus one color in a single word
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ColoredPointer {
    raw: usize,
}

impl ColoredPointer {
    pub const NULL: ColoredPointer = ColoredPointer { raw: 0 };

    /// Encode an address and a color
    ///
    /// Fails for addresses that do not fit in [`ADDRESS_BITS`].
    pub fn encode(address: usize, color: Color) -> Result<Self> {
        if address & !ADDRESS_MASK != 0 {
            return Err(FgcError::InvalidArgument(format!(
                "address {:#x} exceeds {} bits",
                address, ADDRESS_BITS
            )));
        }
        Ok(Self::from_parts(address, color))
    }

    /// Split into address and color
    pub fn decode(self) -> (usize, Color) {
        (self.address(), self.color())
    }

    pub(crate) const fn from_parts(address: usize, color: Color) -> Self {
        Self {
            raw: (address & ADDRESS_MASK) | color.bits(),
        }
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self { raw }
    }

    pub const fn raw(self) -> usize {
        self.raw
    }

    pub const fn address(self) -> usize {
        self.raw & ADDRESS_MASK
    }

    /// Current color; malformed multi-color words read as uncolored so they
    /// are always re-healed
    pub fn color(self) -> Color {
        Color::from_bits(self.raw).unwrap_or(Color::Uncolored)
    }

    pub const fn is_null(self) -> bool {
        self.address() == 0
    }

    pub fn with_color(self, color: Color) -> Self {
        Self::from_parts(self.address(), color)
    }

    pub fn is_marked(self, parity: Parity) -> bool {
        self.color() == parity.mark_color()
    }

    pub fn is_remapped(self) -> bool {
        self.color() == Color::Remapped
    }

    /// Correct a pointer for the current collector state
    ///
    /// A forwarded address wins and yields a `Remapped` pointer. Otherwise a
    /// pointer carrying a stale mark color (or none) is recolored with the
    /// current parity. Remapped, finalizable and current-color pointers are
    /// returned unchanged. `heal(heal(p)) == heal(p)`.
    pub fn heal<L>(self, parity: Parity, lookup: &L) -> Self
    where
        L: ForwardingLookup + ?Sized,
    {
        if self.is_null() {
            return self;
        }

        if let Some(new_address) = lookup.forwarded(self.address()) {
            return Self::from_parts(new_address, Color::Remapped);
        }

        match self.color() {
            Color::Remapped | Color::Finalizable => self,
            color if color == parity.mark_color() => self,
            _ => Self::from_parts(self.address(), parity.mark_color()),
        }
    }
}

impl fmt::Debug for ColoredPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColoredPointer({:#x}, {:?})", self.address(), self.color())
    }
}

impl fmt::Display for ColoredPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address())
    }
}
