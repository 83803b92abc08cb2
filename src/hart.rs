//! The fetch-decode-execute loop.
//!
//! This is the core of the emulator: `Hart::step` advances up to N
//! instructions, applying the pre-decrement-of-jump-targets
//! convention throughout (every control-transfer path computes
//! `pc = target - 4`, relying on the one `pc = pc.wrapping_add(4)` at
//! the bottom of the per-instruction loop to land on the right
//! address, including for trap entry and MRET).

use crate::amo::Amo;
use crate::csr::{Csr, Slot, MSTATUS_MIE};
use crate::host::Host;
use crate::memory::Memory;
use crate::mmio::{self, LoadOutcome, StoreOutcome};
use crate::registers::Registers;
use crate::trap::{enter_trap, mret, Exception, StepStatus, Trap};
use crate::utils::{interpret_u32_as_signed, sign_extend};

// Opcodes (unprivileged spec, chapter 24 instruction listings)
const OP_LUI: u32 = 0b0110111;
const OP_AUIPC: u32 = 0b0010111;
const OP_JAL: u32 = 0b1101111;
const OP_JALR: u32 = 0b1100111;
const OP_BRANCH: u32 = 0b1100011;
const OP_LOAD: u32 = 0b0000011;
const OP_STORE: u32 = 0b0100011;
const OP_IMM: u32 = 0b0010011;
const OP_REG: u32 = 0b0110011;
const OP_FENCE: u32 = 0b0001111;
const OP_AMO: u32 = 0b0101111;
const OP_SYSTEM: u32 = 0b1110011;

#[derive(Debug)]
pub struct Hart {
    pub regs: Registers,
    pub csr: Csr,
    pub mem: Memory,
}

fn field(ir: u32, end: u32, start: u32) -> u32 {
    (ir >> start) & ((1u32 << (end - start + 1)) - 1)
}

fn opcode(ir: u32) -> u32 {
    field(ir, 6, 0)
}
fn rd(ir: u32) -> u32 {
    field(ir, 11, 7)
}
fn funct3(ir: u32) -> u32 {
    field(ir, 14, 12)
}
fn rs1(ir: u32) -> u32 {
    field(ir, 19, 15)
}
fn rs2(ir: u32) -> u32 {
    field(ir, 24, 20)
}
fn funct7(ir: u32) -> u32 {
    field(ir, 31, 25)
}
fn funct5(ir: u32) -> u32 {
    field(ir, 31, 27)
}

fn imm_i(ir: u32) -> u32 {
    sign_extend(field(ir, 31, 20), 11)
}
fn imm_s(ir: u32) -> u32 {
    sign_extend(field(ir, 31, 25) << 5 | field(ir, 11, 7), 11)
}
fn imm_b(ir: u32) -> u32 {
    let bits = field(ir, 7, 7) << 11
        | field(ir, 30, 25) << 5
        | field(ir, 11, 8) << 1
        | field(ir, 31, 31) << 12;
    sign_extend(bits, 12)
}
fn imm_u(ir: u32) -> u32 {
    ir & 0xffff_f000
}
fn imm_j(ir: u32) -> u32 {
    let bits = field(ir, 30, 21) << 1
        | field(ir, 20, 20) << 11
        | field(ir, 19, 12) << 12
        | field(ir, 31, 31) << 20;
    sign_extend(bits, 20)
}

/// Whether this instruction designates a live (possibly-zero)
/// destination register slot. BRANCH, STORE, and the SYSTEM
/// non-Zicsr forms (ECALL/EBREAK/MRET/WFI) never write a register
/// regardless of the `rd` bitfield; every other class does, even
/// when that field happens to be `x0`. This mirrors the reference
/// core's `rdid` computation in `handle_op`, which gates whether the
/// timer interrupt gets a chance to preempt retirement (§4.1 step 4).
fn designates_dest(ir: u32) -> bool {
    match opcode(ir) {
        OP_BRANCH | OP_STORE => false,
        OP_SYSTEM if funct3(ir) == 0 => false,
        _ => rd(ir) != 0,
    }
}

/// The outcome of decoding and executing one instruction: either the
/// architectural effects were fully applied (and the caller should
/// add 4 to pc, unless a trap/syscon path already repositioned it),
/// or a trap was raised.
enum Exec {
    Ok,
    Trapped(Trap),
    Syscon(StoreOutcome),
}

impl Hart {
    pub fn new(total_mem: u32, base_ofs: u32) -> Self {
        let mut csr = Csr::default();
        csr.set_pc(base_ofs);
        Self {
            regs: Registers::default(),
            csr,
            mem: Memory::new(total_mem, base_ofs),
        }
    }

    /// Execute at most `n` instructions. See the design's step-engine
    /// contract: this samples the timer once on entry, may return
    /// without executing anything if parked in WFI, and otherwise
    /// loops until `n` instructions have retired or a trap/halt/reboot
    /// ends the batch early.
    pub fn step(&mut self, n: u32, host: &mut dyn Host) -> StepStatus {
        self.refresh_timer_interrupt(host);

        if self.csr.wfi() {
            return StepStatus::WfiIdle;
        }

        for _ in 0..n {
            self.advance_cycle_counter();

            let pc = self.csr.pc();
            let ofs = match self.mem.offset_of(pc) {
                Some(ofs) if pc & 0x3 == 0 => ofs,
                Some(_) => {
                    enter_trap(
                        &mut self.csr,
                        pc,
                        Trap::Exception {
                            cause: Exception::InstructionAddressMisaligned,
                            tval: Some(pc),
                        },
                    );
                    self.advance_pc();
                    continue;
                }
                None => {
                    enter_trap(
                        &mut self.csr,
                        pc,
                        Trap::Exception {
                            cause: Exception::InstructionAccessFault,
                            tval: Some(pc),
                        },
                    );
                    self.advance_pc();
                    continue;
                }
            };

            let ir = self.mem.read_word(ofs).unwrap_or(0);

            match self.execute(ir, host) {
                Exec::Ok => {
                    // A destination register write takes priority; the
                    // timer interrupt only gets a chance to preempt
                    // retirement of instructions that designate no
                    // live destination (stores, branches, fences, and
                    // the ECALL/EBREAK/MRET/WFI system-immediate
                    // forms), mirroring the reference core's
                    // post-dispatch `rdid ? write : maybe-interrupt`
                    // branch.
                    if !designates_dest(ir) && self.timer_interrupt_ready() {
                        let trap = Trap::Interrupt(crate::trap::Interrupt::Timer);
                        enter_trap(&mut self.csr, pc, trap);
                    }
                    self.advance_pc();
                }
                Exec::Trapped(trap) => {
                    enter_trap(&mut self.csr, pc, trap);
                    self.advance_pc();
                }
                Exec::Syscon(StoreOutcome::Halt(code)) => {
                    self.advance_pc();
                    return StepStatus::Halt(code);
                }
                Exec::Syscon(StoreOutcome::Reboot) => {
                    self.advance_pc();
                    return StepStatus::Reboot;
                }
                Exec::Syscon(_) => self.advance_pc(),
            }
        }

        StepStatus::Continue
    }

    fn timer_interrupt_ready(&self) -> bool {
        self.csr.mie_enabled() && self.mtie_enabled() && self.timer_interrupt_pending()
    }

    fn advance_pc(&mut self) {
        let pc = self.csr.pc();
        self.csr.set_pc(pc.wrapping_add(4));
    }

    fn advance_cycle_counter(&mut self) {
        let cyclel = self.csr.get(Slot::Cyclel) as u64;
        let cycleh = self.csr.get(Slot::Cycleh) as u64;
        let cycle = (cycleh << 32 | cyclel).wrapping_add(1);
        self.csr.set(Slot::Cyclel, cycle as u32);
        self.csr.set(Slot::Cycleh, (cycle >> 32) as u32);
    }

    fn timer_interrupt_pending(&self) -> bool {
        self.csr.get(Slot::Mip) & (1 << 7) != 0
    }

    fn mtie_enabled(&self) -> bool {
        self.csr.get(Slot::Mie) & (1 << 7) != 0
    }

    /// Compare the 64-bit timer against the 64-bit compare value and
    /// latch MTIP in mip accordingly. Called once per step-batch
    /// entry, per the step-engine contract.
    fn refresh_timer_interrupt(&mut self, host: &mut dyn Host) {
        let matched = host.timer_matched();
        let mip = self.csr.get(Slot::Mip);
        if matched {
            self.csr.set(Slot::Mip, mip | (1 << 7));
            self.csr.set_wfi(false);
        } else {
            self.csr.set(Slot::Mip, mip & !(1 << 7));
        }
        self.csr.set(Slot::Timerl, host.timer_low());
        self.csr.set(Slot::Timerh, host.timer_high());
    }

    fn execute(&mut self, ir: u32, host: &mut dyn Host) -> Exec {
        match opcode(ir) {
            OP_LUI => {
                self.regs.write(rd(ir), imm_u(ir));
                Exec::Ok
            }
            OP_AUIPC => {
                self.regs
                    .write(rd(ir), self.csr.pc().wrapping_add(imm_u(ir)));
                Exec::Ok
            }
            OP_JAL => {
                self.regs.write(rd(ir), self.csr.pc().wrapping_add(4));
                let target = self.csr.pc().wrapping_add(imm_j(ir));
                self.csr.set_pc(target.wrapping_sub(4));
                Exec::Ok
            }
            OP_JALR => {
                let base = self.regs.read(rs1(ir));
                self.regs.write(rd(ir), self.csr.pc().wrapping_add(4));
                let target = base.wrapping_add(imm_i(ir)) & !1;
                self.csr.set_pc(target.wrapping_sub(4));
                Exec::Ok
            }
            OP_BRANCH => self.execute_branch(ir),
            OP_LOAD => self.execute_load(ir, host),
            OP_STORE => self.execute_store(ir, host),
            OP_IMM => self.execute_alu(ir, true),
            OP_REG => self.execute_alu(ir, false),
            OP_FENCE => Exec::Ok,
            OP_AMO => self.execute_amo(ir),
            OP_SYSTEM => self.execute_system(ir),
            _ => Exec::Trapped(Trap::Exception {
                cause: Exception::IllegalInstruction,
                tval: Some(ir),
            }),
        }
    }

    fn execute_branch(&mut self, ir: u32) -> Exec {
        let a = self.regs.read(rs1(ir));
        let b = self.regs.read(rs2(ir));
        let taken = match funct3(ir) {
            0b000 => a == b,
            0b001 => a != b,
            0b100 => interpret_u32_as_signed(a) < interpret_u32_as_signed(b),
            0b101 => interpret_u32_as_signed(a) >= interpret_u32_as_signed(b),
            0b110 => a < b,
            0b111 => a >= b,
            _ => {
                return Exec::Trapped(Trap::Exception {
                    cause: Exception::IllegalInstruction,
                    tval: Some(ir),
                })
            }
        };
        if taken {
            let target = self.csr.pc().wrapping_add(imm_b(ir));
            self.csr.set_pc(target.wrapping_sub(4));
        }
        Exec::Ok
    }

    fn execute_load(&mut self, ir: u32, host: &mut dyn Host) -> Exec {
        let addr = self.regs.read(rs1(ir)).wrapping_add(imm_i(ir));

        // RAM fast path vs device window, mirroring the memory-fabric
        // routing table: offsets within range are ordinary RAM,
        // everything else is dispatched to the device window.
        if let Some(ofs) = self.mem.data_offset_of(addr) {
            let value = match funct3(ir) {
                0b000 => sign_extend(self.mem.read_byte(ofs).unwrap_or(0) as u32, 7),
                0b001 => sign_extend(self.mem.read_halfword(ofs).unwrap_or(0) as u32, 15),
                0b010 => self.mem.read_word(ofs).unwrap_or(0),
                0b100 => self.mem.read_byte(ofs).unwrap_or(0) as u32,
                0b101 => self.mem.read_halfword(ofs).unwrap_or(0) as u32,
                _ => {
                    return Exec::Trapped(Trap::Exception {
                        cause: Exception::IllegalInstruction,
                        tval: Some(ir),
                    })
                }
            };
            self.regs.write(rd(ir), value);
            Exec::Ok
        } else {
            match mmio::load(host, addr) {
                LoadOutcome::Value(value) => {
                    self.regs.write(rd(ir), value);
                    Exec::Ok
                }
                LoadOutcome::Unmapped => Exec::Trapped(Trap::Exception {
                    cause: Exception::LoadAccessFault,
                    tval: Some(addr),
                }),
            }
        }
    }

    fn execute_store(&mut self, ir: u32, host: &mut dyn Host) -> Exec {
        let addr = self.regs.read(rs1(ir)).wrapping_add(imm_s(ir));
        let value = self.regs.read(rs2(ir));
        if let Some(ofs) = self.mem.data_offset_of(addr) {
            let result = match funct3(ir) {
                0b000 => self.mem.write_byte(ofs, value as u8),
                0b001 => self.mem.write_halfword(ofs, value as u16),
                0b010 => self.mem.write_word(ofs, value),
                _ => {
                    return Exec::Trapped(Trap::Exception {
                        cause: Exception::IllegalInstruction,
                        tval: Some(ir),
                    })
                }
            };
            match result {
                Ok(()) => Exec::Ok,
                Err(_) => Exec::Trapped(Trap::Exception {
                    cause: Exception::StoreAccessFault,
                    tval: Some(addr),
                }),
            }
        } else {
            match mmio::store(host, addr, value) {
                StoreOutcome::Unmapped => Exec::Trapped(Trap::Exception {
                    cause: Exception::StoreAccessFault,
                    tval: Some(addr),
                }),
                outcome @ (StoreOutcome::Halt(_) | StoreOutcome::Reboot) => Exec::Syscon(outcome),
                StoreOutcome::Ok => Exec::Ok,
            }
        }
    }

    fn execute_alu(&mut self, ir: u32, is_imm: bool) -> Exec {
        let a = self.regs.read(rs1(ir));
        let b = if is_imm {
            imm_i(ir)
        } else {
            self.regs.read(rs2(ir))
        };

        if !is_imm && funct7(ir) & 0b000_0001 != 0 {
            // M-extension register-register encoding space: pinned
            // policy is to treat this as illegal rather than
            // implement MUL/DIV/REM (this core is RV32IA, not
            // RV32IMA).
            return Exec::Trapped(Trap::Exception {
                cause: Exception::IllegalInstruction,
                tval: Some(ir),
            });
        }

        let shamt = b & 0x1f;
        let value = match funct3(ir) {
            0b000 => {
                if !is_imm && funct7(ir) == 0b0100000 {
                    a.wrapping_sub(b)
                } else {
                    a.wrapping_add(b)
                }
            }
            0b001 => a.wrapping_shl(shamt),
            0b010 => (interpret_u32_as_signed(a) < interpret_u32_as_signed(b)) as u32,
            0b011 => (a < b) as u32,
            0b100 => a ^ b,
            0b101 => {
                if funct7(ir) == 0b0100000 {
                    (interpret_u32_as_signed(a) >> shamt) as u32
                } else {
                    a.wrapping_shr(shamt)
                }
            }
            0b110 => a | b,
            0b111 => a & b,
            _ => unreachable!("funct3 is a 3-bit field"),
        };
        self.regs.write(rd(ir), value);
        Exec::Ok
    }

    fn execute_amo(&mut self, ir: u32) -> Exec {
        let addr = self.regs.read(rs1(ir));
        let ofs = match self.mem.data_offset_of(addr) {
            Some(ofs) => ofs,
            None => {
                return Exec::Trapped(Trap::Exception {
                    cause: Exception::StoreAccessFault,
                    tval: Some(addr),
                })
            }
        };
        let amo = match Amo::decode(funct5(ir)) {
            Some(amo) => amo,
            None => {
                return Exec::Trapped(Trap::Exception {
                    cause: Exception::IllegalInstruction,
                    tval: Some(ir),
                })
            }
        };
        let current = self.mem.read_word(ofs).unwrap_or(0);
        let operand = self.regs.read(rs2(ir));
        let (rd_value, to_store, writes) = amo.apply(current, operand);
        if writes {
            let _ = self.mem.write_word(ofs, to_store);
        }
        self.regs.write(rd(ir), rd_value);
        Exec::Ok
    }

    fn execute_system(&mut self, ir: u32) -> Exec {
        let f3 = funct3(ir);
        if f3 == 0 {
            return match field(ir, 31, 20) {
                0x000 => {
                    let cause = if self.csr.privilege() == crate::csr::PRIV_MACHINE {
                        Exception::EcallFromMMode
                    } else {
                        Exception::EcallFromUMode
                    };
                    Exec::Trapped(Trap::Exception { cause, tval: None })
                }
                0x001 => Exec::Trapped(Trap::Exception {
                    cause: Exception::Breakpoint,
                    tval: None,
                }),
                0x302 => {
                    mret(&mut self.csr);
                    Exec::Ok
                }
                0x105 => {
                    let mstatus = self.csr.get(Slot::Mstatus);
                    self.csr.set(Slot::Mstatus, mstatus | MSTATUS_MIE);
                    self.csr.set_wfi(true);
                    Exec::Ok
                }
                _ => Exec::Trapped(Trap::Exception {
                    cause: Exception::IllegalInstruction,
                    tval: Some(ir),
                }),
            };
        }

        let csr_num = field(ir, 31, 20) as u16;
        let uses_imm = f3 >= 0b101;
        let operand = if uses_imm { rs1(ir) } else { self.regs.read(rs1(ir)) };
        // CSRRW/CSRRWI always write. CSRRS/CSRRC skip the write when
        // rs1 is x0 (the read-modify-write would be a no-op); the
        // immediate forms skip it when the 5-bit immediate is zero,
        // for the same reason (unprivileged spec, section 9).
        let writes = match f3 & 0b011 {
            0b001 => true,
            _ => operand != 0,
        };
        let combine: fn(u32, u32) -> u32 = match f3 & 0b011 {
            0b001 => |_, new| new,
            0b010 => |prev, mask| prev | mask,
            0b011 => |prev, mask| prev & !mask,
            _ => unreachable!(),
        };

        match self.csr.modify_csr(csr_num, operand, combine, writes) {
            Ok(prev) => {
                self.regs.write(rd(ir), prev);
                Exec::Ok
            }
            Err(_) => Exec::Trapped(Trap::Exception {
                cause: Exception::IllegalInstruction,
                tval: Some(ir),
            }),
        }
    }
}
