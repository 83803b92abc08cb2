//! Exceptions, interrupts, and the trap-entry/return side effects.
//!
//! The reference core this design is based on multiplexes "no trap" /
//! "exception" / "interrupt" into a single `u32` using a `+1` offset
//! and an MSB-set convention for interrupts. This rewrite replaces
//! that with an explicit tagged [`Trap`] so the step engine's match
//! arms read as what they mean rather than as a magic-number
//! comparison.

use crate::csr::{Csr, Slot, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP_SHIFT, PRIV_MACHINE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAccessFault,
    StoreAccessFault,
    EcallFromUMode,
    EcallFromMMode,
}

impl Exception {
    pub fn cause(self) -> u32 {
        match self {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAccessFault => 5,
            Exception::StoreAccessFault => 7,
            Exception::EcallFromUMode => 8,
            Exception::EcallFromMMode => 11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Software,
    Timer,
    External,
}

impl Interrupt {
    pub fn cause(self) -> u32 {
        match self {
            Interrupt::Software => 3,
            Interrupt::Timer => 7,
            Interrupt::External => 11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Exception { cause: Exception, tval: Option<u32> },
    Interrupt(Interrupt),
}

impl Trap {
    /// The value to store in mcause: interrupts have the MSB set,
    /// exceptions do not (privileged spec, section 3.1.15).
    pub fn mcause(&self) -> u32 {
        match self {
            Trap::Exception { cause, .. } => cause.cause(),
            Trap::Interrupt(int) => 0x8000_0000 | int.cause(),
        }
    }
}

/// Status returned by a completed instruction batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The batch completed; refresh the timer and call step again.
    Continue,
    /// The hart is parked in WFI; no instructions were executed.
    WfiIdle,
    /// The guest wrote a halt code to SYSCON. The raw value is
    /// preserved rather than collapsed to a boolean so callers can
    /// distinguish graceful poweroff (conventionally 0x5555) from
    /// other implementation-defined halt reasons.
    Halt(u32),
    /// The guest wrote the SYSCON reboot code (0x7777).
    Reboot,
}

/// Apply the trap-entry side effects described in the privileged
/// spec section 3.1.6.1: save `pc` to `mepc`, move MIE into MPIE and
/// the current privilege mode into MPP, and compute the new `pc`
/// (pre-decremented by 4, since the step loop unconditionally adds 4
/// after every instruction including trapped ones).
pub fn enter_trap(csr: &mut Csr, trapping_pc: u32, trap: Trap) {
    let mcause = trap.mcause();
    csr.set(Slot::Mcause, mcause);

    match trap {
        Trap::Exception { tval, .. } => {
            csr.set(Slot::Mtval, tval.unwrap_or(trapping_pc));
            csr.set(Slot::Mepc, trapping_pc);
        }
        Trap::Interrupt(_) => {
            csr.set(Slot::Mtval, 0);
            // the interrupted instruction has not executed; the
            // return address is the next instruction, which the step
            // loop's `pc += 4` has not yet applied to `trapping_pc`.
            csr.set(Slot::Mepc, trapping_pc.wrapping_add(4));
        }
    }

    let mstatus = csr.get(Slot::Mstatus);
    let mie = mstatus & MSTATUS_MIE != 0;
    let new_mstatus = (mstatus & !(MSTATUS_MIE | MSTATUS_MPIE | (0x3 << MSTATUS_MPP_SHIFT)))
        | (if mie { MSTATUS_MPIE } else { 0 })
        | (csr.privilege() << MSTATUS_MPP_SHIFT);
    csr.set(Slot::Mstatus, new_mstatus);

    if matches!(trap, Trap::Exception { .. }) {
        csr.set_privilege(PRIV_MACHINE);
    }

    let mtvec = csr.get(Slot::Mtvec);
    csr.set_pc(mtvec.wrapping_sub(4));
}

/// Apply MRET: restore privilege and MIE from MPP/MPIE, and return
/// the address to resume at (pre-decremented, per the same `pc += 4`
/// convention as `enter_trap`).
pub fn mret(csr: &mut Csr) {
    let mstatus = csr.get(Slot::Mstatus);
    let mpie = mstatus & MSTATUS_MPIE != 0;
    let mpp = (mstatus >> MSTATUS_MPP_SHIFT) & 0x3;

    let new_mstatus = (mstatus & !(MSTATUS_MIE | MSTATUS_MPIE))
        | (if mpie { MSTATUS_MIE } else { 0 })
        | MSTATUS_MPIE;
    csr.set(Slot::Mstatus, new_mstatus);
    csr.set_privilege(mpp);

    let mepc = csr.get(Slot::Mepc);
    csr.set_pc(mepc.wrapping_sub(4));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::Slot;

    #[test]
    fn exception_mcause_has_no_msb() {
        let trap = Trap::Exception {
            cause: Exception::IllegalInstruction,
            tval: None,
        };
        assert_eq!(trap.mcause(), 2);
    }

    #[test]
    fn interrupt_mcause_has_msb_set() {
        let trap = Trap::Interrupt(Interrupt::Timer);
        assert_eq!(trap.mcause(), 0x8000_0007);
    }

    #[test]
    fn trap_entry_saves_mepc_and_vectors_to_mtvec() {
        let mut csr = Csr::default();
        csr.set(Slot::Mtvec, 0x8000_0100);
        enter_trap(
            &mut csr,
            0x8000_0004,
            Trap::Exception {
                cause: Exception::IllegalInstruction,
                tval: Some(0x8000_0004),
            },
        );
        assert_eq!(csr.get(Slot::Mepc), 0x8000_0004);
        assert_eq!(csr.get(Slot::Mcause), 2);
        assert_eq!(csr.get(Slot::Mtval), 0x8000_0004);
        // pc pre-decremented; the step loop will add 4 back
        assert_eq!(csr.pc(), 0x8000_0100 - 4);
    }

    #[test]
    fn trap_then_mret_restores_mie() {
        let mut csr = Csr::default();
        csr.set(Slot::Mstatus, MSTATUS_MIE);
        csr.set(Slot::Mtvec, 0x8000_0100);
        enter_trap(
            &mut csr,
            0x8000_0004,
            Trap::Interrupt(Interrupt::Timer),
        );
        assert_eq!(csr.get(Slot::Mstatus) & MSTATUS_MIE, 0);
        assert_ne!(csr.get(Slot::Mstatus) & MSTATUS_MPIE, 0);

        mret(&mut csr);
        assert_ne!(csr.get(Slot::Mstatus) & MSTATUS_MIE, 0);
        assert_eq!(csr.pc(), 0x8000_0004 + 4 - 4);
    }
}
