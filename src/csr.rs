//! Control and status registers.
//!
//! From the unprivileged spec version 20191213, chapter 9: "RISC-V
//! defines a separate address space of 4096 Control and Status
//! registers associated with each hart". This core implements the
//! minimal M-mode subset needed to run a simple kernel; CSR state
//! itself is a dense array indexed by [`Slot`] rather than addressed
//! directly by the 12-bit CSR number, which is translated via
//! [`slot_for_csr`].

use thiserror::Error;

use crate::utils::extract_field;

/// Dense index into the CSR array. `Pc` and `Extraflags` have no
/// architectural CSR number of their own; they are internal slots
/// that happen to live in the same array for uniformity with the
/// reference core this design is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Slot {
    Mstatus = 0,
    Cyclel = 1,
    Mscratch = 2,
    Mtvec = 3,
    Mie = 4,
    Mip = 5,
    Mepc = 6,
    Mtval = 7,
    Mcause = 8,
    Mvendorid = 9,
    Misa = 10,
    Pc = 11,
    Extraflags = 12,
    Cycleh = 13,
    Timerl = 14,
    Timerh = 15,
    Timermatchl = 16,
    Timermatchh = 17,
}

pub const NUM_SLOTS: usize = 18;

/// Translate a 12-bit CSR number into a dense slot, for the CSRs this
/// core actually implements.
fn slot_for_csr(csr: u16) -> Option<Slot> {
    match csr {
        0x300 => Some(Slot::Mstatus),
        0xC00 => Some(Slot::Cyclel),
        0x340 => Some(Slot::Mscratch),
        0x305 => Some(Slot::Mtvec),
        0x304 => Some(Slot::Mie),
        0x344 => Some(Slot::Mip),
        0x341 => Some(Slot::Mepc),
        0x343 => Some(Slot::Mtval),
        0x342 => Some(Slot::Mcause),
        0xF11 => Some(Slot::Mvendorid),
        0x301 => Some(Slot::Misa),
        0xC80 => Some(Slot::Cycleh),
        _ => None,
    }
}

/// A CSR address with bits [11:10] == 0b11 is read-only by
/// architectural convention (unprivileged spec chapter 9); both
/// `mvendorid` and `misa` fall in that range on this core and have no
/// defined write semantics.
fn read_only_csr(csr: u16) -> bool {
    extract_field(csr, 11, 10) == 0b11
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsrError {
    #[error("CSR 0x{0:x} does not exist (illegal instruction)")]
    NonExistentCsr(u16),
    #[error("attempted write to read-only CSR 0x{0:x} (illegal instruction)")]
    ReadOnlyCsr(u16),
}

/// Dense CSR file, extraflags, and the program counter.
#[derive(Debug)]
pub struct Csr {
    slots: [u32; NUM_SLOTS],
}

// extraflags bit layout (slot 12)
pub const EXTRAFLAGS_PRIV_MASK: u32 = 0x3;
pub const EXTRAFLAGS_WFI: u32 = 1 << 2;

// mstatus bits
pub const MSTATUS_MIE: u32 = 1 << 3;
pub const MSTATUS_MPIE: u32 = 1 << 7;
pub const MSTATUS_MPP_SHIFT: u32 = 11;

pub const PRIV_MACHINE: u32 = 3;

impl Default for Csr {
    fn default() -> Self {
        let mut slots = [0u32; NUM_SLOTS];
        slots[Slot::Mvendorid as usize] = 0xff0f_f0ff;
        slots[Slot::Misa as usize] = 0x4040_1101;
        slots[Slot::Extraflags as usize] = PRIV_MACHINE;
        Self { slots }
    }
}

impl Csr {
    pub fn get(&self, slot: Slot) -> u32 {
        self.slots[slot as usize]
    }

    pub fn set(&mut self, slot: Slot, value: u32) {
        self.slots[slot as usize] = value;
    }

    pub fn pc(&self) -> u32 {
        self.get(Slot::Pc)
    }

    pub fn set_pc(&mut self, value: u32) {
        self.set(Slot::Pc, value);
    }

    pub fn privilege(&self) -> u32 {
        self.get(Slot::Extraflags) & EXTRAFLAGS_PRIV_MASK
    }

    pub fn set_privilege(&mut self, priv_mode: u32) {
        let flags = self.get(Slot::Extraflags);
        self.set(
            Slot::Extraflags,
            (flags & !EXTRAFLAGS_PRIV_MASK) | (priv_mode & EXTRAFLAGS_PRIV_MASK),
        );
    }

    pub fn wfi(&self) -> bool {
        self.get(Slot::Extraflags) & EXTRAFLAGS_WFI != 0
    }

    pub fn set_wfi(&mut self, wfi: bool) {
        let flags = self.get(Slot::Extraflags);
        self.set(
            Slot::Extraflags,
            if wfi {
                flags | EXTRAFLAGS_WFI
            } else {
                flags & !EXTRAFLAGS_WFI
            },
        );
    }

    pub fn mie_enabled(&self) -> bool {
        self.get(Slot::Mstatus) & MSTATUS_MIE != 0
    }

    /// Read a CSR by its architectural 12-bit number. Returns the
    /// value prior to any write performed in the same instruction,
    /// as required by CSRR{W,S,C}{,I}.
    pub fn read_csr(&self, csr: u16) -> Result<u32, CsrError> {
        let slot = slot_for_csr(csr).ok_or(CsrError::NonExistentCsr(csr))?;
        Ok(self.get(slot))
    }

    /// Perform the read-modify-write of a CSRR{W,S,C}{,I} instruction.
    /// `combine` folds the previous value and the operand according
    /// to which of the six Zicsr variants is executing (write,
    /// set-bits, or clear-bits).
    pub fn modify_csr(
        &mut self,
        csr: u16,
        operand: u32,
        combine: impl FnOnce(u32, u32) -> u32,
        writes: bool,
    ) -> Result<u32, CsrError> {
        let slot = slot_for_csr(csr).ok_or(CsrError::NonExistentCsr(csr))?;
        let prev = self.get(slot);
        if writes {
            if read_only_csr(csr) {
                return Err(CsrError::ReadOnlyCsr(csr));
            }
            self.set(slot, combine(prev, operand));
        }
        Ok(prev)
    }
}
