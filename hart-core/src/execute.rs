//! Executes a decoded [`Instruction`] against a [`Hart`](crate::hart::Hart)'s architectural
//! state: register writeback, memory access, and control-flow/CSR side effects.
//!
//! The fetch-decode loop in [`hart`](crate::hart) already advances `pc` past the instruction
//! before calling in here, so most operations below only need to touch `x` registers or memory;
//! only control-flow instructions overwrite `pc` themselves.

use crate::hart::Hart;
use crate::instruction::{
    BranchCondition, CsrOp, Instruction, LoadWidth, RegImmOp, RegImmOp32, RegRegOp, RegRegOp32,
    RegShiftImmOp, RegShiftImmOp32, StoreWidth,
};
use crate::registers::Specifier;
use crate::system_bus::BusError;
use crate::trap::Exception;
use crate::Alignment;
use log::trace;

impl Hart {
    pub(crate) fn execute(&mut self, instruction: Instruction, pc: u64) -> Result<(), Exception> {
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                trace!("{op:?} {dest} {src} {immediate}");
                let value = self.registers.x(src);
                let result = match op {
                    RegImmOp::Addi => value.wrapping_add_signed(immediate),
                    RegImmOp::Slti => ((value as i64) < immediate) as u64,
                    RegImmOp::Sltiu => (value < immediate as u64) as u64,
                    RegImmOp::Xori => value ^ (immediate as u64),
                    RegImmOp::Ori => value | (immediate as u64),
                    RegImmOp::Andi => value & (immediate as u64),
                };
                self.registers.set_x(dest, result);
                Ok(())
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount,
            } => {
                trace!("{op:?} {dest} {src} {shift_amount}");
                let value = self.registers.x(src);
                let result = match op {
                    RegShiftImmOp::Slli => value << shift_amount,
                    RegShiftImmOp::Srli => value >> shift_amount,
                    RegShiftImmOp::Srai => ((value as i64) >> shift_amount) as u64,
                };
                self.registers.set_x(dest, result);
                Ok(())
            }
            Instruction::OpImm32 {
                op,
                dest,
                src,
                immediate,
            } => {
                trace!("{op:?} {dest} {src} {immediate}");
                let src32 = self.registers.x(src) as i32;
                let result = match op {
                    RegImmOp32::Addiw => src32.wrapping_add(immediate as i32),
                };
                self.registers.set_x(dest, result as i64 as u64);
                Ok(())
            }
            Instruction::OpShiftImm32 {
                op,
                dest,
                src,
                shift_amount,
            } => {
                trace!("{op:?} {dest} {src} {shift_amount}");
                let value = self.registers.x(src);
                let result = match op {
                    RegShiftImmOp32::Slliw => ((value as u32) << shift_amount) as i32,
                    RegShiftImmOp32::Srliw => ((value as u32) >> shift_amount) as i32,
                    RegShiftImmOp32::Sraiw => (value as i32) >> shift_amount,
                };
                self.registers.set_x(dest, result as i64 as u64);
                Ok(())
            }
            Instruction::Lui { dest, immediate } => {
                trace!("lui {dest} {immediate}");
                self.registers.set_x(dest, immediate as u64);
                Ok(())
            }
            Instruction::Auipc { dest, immediate } => {
                trace!("auipc {dest} {immediate}");
                self.registers.set_x(dest, pc.wrapping_add_signed(immediate));
                Ok(())
            }
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                trace!("{op:?} {dest} {src1} {src2}");
                let v1 = self.registers.x(src1);
                let v2 = self.registers.x(src2);
                let result = match op {
                    RegRegOp::Add => v1.wrapping_add(v2),
                    RegRegOp::Sub => v1.wrapping_sub(v2),
                    RegRegOp::Sll => v1 << (v2 & 0x3F),
                    RegRegOp::Slt => ((v1 as i64) < (v2 as i64)) as u64,
                    RegRegOp::Sltu => (v1 < v2) as u64,
                    RegRegOp::Xor => v1 ^ v2,
                    RegRegOp::Srl => v1 >> (v2 & 0x3F),
                    RegRegOp::Sra => ((v1 as i64) >> (v2 & 0x3F)) as u64,
                    RegRegOp::Or => v1 | v2,
                    RegRegOp::And => v1 & v2,
                };
                self.registers.set_x(dest, result);
                Ok(())
            }
            Instruction::Op32 {
                op,
                dest,
                src1,
                src2,
            } => {
                trace!("{op:?} {dest} {src1} {src2}");
                let v1 = self.registers.x(src1);
                let v2 = self.registers.x(src2);
                let result = match op {
                    RegRegOp32::Addw => (v1 as i32).wrapping_add(v2 as i32),
                    RegRegOp32::Subw => (v1 as i32).wrapping_sub(v2 as i32),
                    RegRegOp32::Sllw => ((v1 as u32) << ((v2 as u32) & 0x1F)) as i32,
                    RegRegOp32::Srlw => ((v1 as u32) >> ((v2 as u32) & 0x1F)) as i32,
                    RegRegOp32::Sraw => (v1 as i32) >> ((v2 as u32) & 0x1F),
                };
                self.registers.set_x(dest, result as i64 as u64);
                Ok(())
            }
            Instruction::Jal { dest, offset } => {
                trace!("jal {dest} {offset}");
                let target = pc.wrapping_add_signed(offset);
                self.take_jump(dest, pc, target)
            }
            Instruction::Jalr { dest, base, offset } => {
                trace!("jalr {dest} {base} {offset}");
                let target = self.registers.x(base).wrapping_add_signed(offset) & !1;
                self.take_jump(dest, pc, target)
            }
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                trace!("{condition:?} {src1} {src2} {offset}");
                let v1 = self.registers.x(src1);
                let v2 = self.registers.x(src2);
                let taken = match condition {
                    BranchCondition::Beq => v1 == v2,
                    BranchCondition::Bne => v1 != v2,
                    BranchCondition::Blt => (v1 as i64) < (v2 as i64),
                    BranchCondition::Bltu => v1 < v2,
                    BranchCondition::Bge => (v1 as i64) >= (v2 as i64),
                    BranchCondition::Bgeu => v1 >= v2,
                };
                if taken {
                    let target = pc.wrapping_add_signed(offset);
                    if !Alignment::HALFWORD.is_aligned(target) {
                        return Err(Exception::InstructionAddressMisaligned(target));
                    }
                    *self.registers.pc_mut() = target;
                }
                Ok(())
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => {
                trace!("{width:?} {dest} {offset}({base})");
                let address = self.registers.x(base).wrapping_add_signed(offset);
                let value = self.load(width, address)?;
                self.registers.set_x(dest, value);
                Ok(())
            }
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => {
                trace!("{width:?} {src} {offset}({base})");
                let address = self.registers.x(base).wrapping_add_signed(offset);
                let value = self.registers.x(src);
                self.store(width, address, value)
            }
            Instruction::Fence => Ok(()),
            Instruction::Ecall => {
                trace!("ecall");
                Err(Exception::ecall_from(self.privilege))
            }
            Instruction::Ebreak => {
                trace!("ebreak");
                Err(Exception::Breakpoint)
            }
            Instruction::Mret => {
                trace!("mret");
                self.mret()
            }
            Instruction::Sret => {
                trace!("sret");
                self.sret()
            }
            Instruction::Wfi => {
                trace!("wfi");
                Ok(())
            }
            Instruction::Csr { op, dest, csr, src } => {
                trace!("{op:?} {dest} {csr:#x} {src}");
                let operand = (op == CsrOp::ReadWrite || src != Specifier::X0)
                    .then(|| self.registers.x(src));
                self.csr_op(op, dest, csr, operand)
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                trace!("{op:?} {dest} {csr:#x} {immediate}");
                let operand =
                    (op == CsrOp::ReadWrite || immediate != 0).then_some(immediate as u64);
                self.csr_op(op, dest, csr, operand)
            }
        }
    }

    /// Shared tail of `JAL`/`JALR`: validate the target, then commit it and the link register.
    fn take_jump(&mut self, dest: Specifier, pc: u64, target: u64) -> Result<(), Exception> {
        if !Alignment::HALFWORD.is_aligned(target) {
            return Err(Exception::InstructionAddressMisaligned(target));
        }
        self.registers.set_x(dest, pc.wrapping_add(4));
        *self.registers.pc_mut() = target;
        Ok(())
    }

    fn load(&mut self, width: LoadWidth, address: u64) -> Result<u64, Exception> {
        let size = match width {
            LoadWidth::Lb | LoadWidth::Lbu => 1,
            LoadWidth::Lh | LoadWidth::Lhu => 2,
            LoadWidth::Lw | LoadWidth::Lwu => 4,
            LoadWidth::Ld => 8,
        };
        self.check_alignment(address, size)
            .map_err(Exception::LoadAddressMisaligned)?;
        let raw = self.bus.read(address, size).map_err(|err| match err {
            BusError::OutOfBounds(_) | BusError::NoDevice(_) => Exception::LoadAccessFault(address),
        })?;
        Ok(match width {
            LoadWidth::Lb => raw as u8 as i8 as i64 as u64,
            LoadWidth::Lh => raw as u16 as i16 as i64 as u64,
            LoadWidth::Lw => raw as u32 as i32 as i64 as u64,
            LoadWidth::Ld => raw,
            LoadWidth::Lbu => raw as u8 as u64,
            LoadWidth::Lhu => raw as u16 as u64,
            LoadWidth::Lwu => raw as u32 as u64,
        })
    }

    fn store(&mut self, width: StoreWidth, address: u64, value: u64) -> Result<(), Exception> {
        let size = match width {
            StoreWidth::Sb => 1,
            StoreWidth::Sh => 2,
            StoreWidth::Sw => 4,
            StoreWidth::Sd => 8,
        };
        self.check_alignment(address, size)
            .map_err(Exception::StoreOrAmoAddressMisaligned)?;
        if self.maybe_divert_tohost(address, size, value) {
            return Ok(());
        }
        self.bus.write(address, size, value).map_err(|err| match err {
            BusError::OutOfBounds(_) | BusError::NoDevice(_) => {
                Exception::StoreOrAmoAccessFault(address)
            }
        })
    }

    /// Returns `Err(address)` if `address` is not naturally aligned for `size` and the
    /// configuration does not tolerate misaligned accesses.
    fn check_alignment(&self, address: u64, size: u8) -> Result<(), u64> {
        if self.support_misaligned_memory_access() {
            return Ok(());
        }
        let alignment = Alignment::natural_for_size(size as u64).expect("size is a power of two");
        if alignment.is_aligned(address) {
            Ok(())
        } else {
            Err(address)
        }
    }

    /// Shared implementation of `CSRRW`/`CSRRS`/`CSRRC`(`I`).
    ///
    /// `operand` is `None` when the write must be skipped entirely: `rs1 == x0` (or `uimm == 0`)
    /// on a `ReadSet`/`ReadClear`, which lets `csrrs rd, csr, x0` read a read-only CSR without
    /// tripping its write-protection.
    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: u16,
        operand: Option<u64>,
    ) -> Result<(), Exception> {
        let privilege = self.privilege;
        if op != CsrOp::ReadWrite || dest != Specifier::X0 {
            let old_value = self.csrs.get(csr, privilege)?;
            self.registers.set_x(dest, old_value);
        }
        if let Some(operand) = operand {
            let old_value = self.csrs.get(csr, privilege)?;
            let new_value = match op {
                CsrOp::ReadWrite => operand,
                CsrOp::ReadSet => old_value | operand,
                CsrOp::ReadClear => old_value & !operand,
            };
            self.csrs.set(csr, new_value, privilege)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::csr::address;
    use crate::hart::{Config, Hart};
    use crate::memory::Memory;
    use crate::registers::Specifier;
    use crate::system_bus::SystemBus;

    fn hart_with_ram(reset_vector: u64, tohost: Option<u64>) -> Hart {
        let mut bus = SystemBus::new();
        bus.register(reset_vector, Box::new(Memory::new(4096)))
            .unwrap();
        Hart::new(
            Config {
                reset_vector,
                tohost_address: tohost,
                ..Config::default()
            },
            bus,
        )
    }

    fn store32(hart: &mut Hart, address: u64, value: u32) {
        hart.bus_mut().write(address, 4, value as u64).unwrap();
    }

    #[test]
    fn test_addi_and_add_accumulate() {
        let mut hart = hart_with_ram(0, None);
        // addi x1, x0, 5
        store32(&mut hart, 0, 0x0050_0093);
        // addi x2, x0, 7
        store32(&mut hart, 4, 0x0070_0113);
        // add x3, x1, x2
        store32(&mut hart, 8, 0x0020_81B3);
        assert!(hart.step());
        assert!(hart.step());
        assert!(hart.step());
        assert_eq!(hart.registers().x(Specifier::from_u5(3)), 12);
        assert_eq!(hart.registers().pc(), 12);
    }

    #[test]
    fn test_lui_then_addi_builds_sign_extended_constant() {
        let mut hart = hart_with_ram(0, None);
        // lui x1, 0xFFFFF (top bit set, sign-extends to all-ones above bit 31 on RV64)
        store32(&mut hart, 0, 0xFFFF_F0B7);
        assert!(hart.step());
        assert_eq!(
            hart.registers().x(Specifier::from_u5(1)),
            0xFFFF_FFFF_FFFF_F000
        );
    }

    #[test]
    fn test_store_then_load_doubleword_roundtrips() {
        let mut hart = hart_with_ram(0, None);
        hart.registers.set_x(Specifier::from_u5(1), 0x100);
        hart.registers.set_x(Specifier::from_u5(2), 0xDEAD_BEEF_CAFE_F00D);
        // sd x2, 0(x1)
        store32(&mut hart, 0, 0x0020_B023);
        // ld x3, 0(x1)
        store32(&mut hart, 4, 0x0000_B183);
        assert!(hart.step());
        assert!(hart.step());
        assert_eq!(
            hart.registers().x(Specifier::from_u5(3)),
            0xDEAD_BEEF_CAFE_F00D
        );
    }

    #[test]
    fn test_lb_sign_extends_negative_byte() {
        let mut hart = hart_with_ram(0, None);
        hart.registers.set_x(Specifier::from_u5(1), 0x100);
        hart.bus_mut().write(0x100, 1, 0xFF).unwrap();
        // lb x2, 0(x1)
        store32(&mut hart, 0, 0x0000_8103);
        assert!(hart.step());
        assert_eq!(
            hart.registers().x(Specifier::from_u5(2)),
            0xFFFF_FFFF_FFFF_FFFF
        );
    }

    #[test]
    fn test_ecall_traps_into_machine_mode() {
        let mut hart = hart_with_ram(0, None);
        hart.csrs
            .set(address::MTVEC, 0x200, crate::PrivilegeLevel::Machine)
            .unwrap();
        // ecall
        store32(&mut hart, 0, 0x0000_0073);
        assert!(hart.step());
        assert_eq!(hart.registers().pc(), 0x200);
        assert_eq!(hart.csrs().mepc(), 0);
        assert_eq!(
            hart.csrs().get(address::MCAUSE, hart.privilege()).unwrap(),
            11
        );
    }

    #[test]
    fn test_mret_restores_pc_and_privilege() {
        let mut hart = hart_with_ram(0, None);
        hart.csrs
            .set(address::MTVEC, 0x100, crate::PrivilegeLevel::Machine)
            .unwrap();
        store32(&mut hart, 0, 0x0000_0073); // ecall
        store32(&mut hart, 0x100, 0x3020_0073); // mret, at the trap vector
        assert!(hart.step());
        assert_eq!(hart.registers().pc(), 0x100);
        assert_eq!(hart.csrs().mepc(), 0);
        assert!(hart.step());
        assert_eq!(hart.registers().pc(), 0);
        assert_eq!(hart.privilege(), crate::PrivilegeLevel::Machine);
    }

    #[test]
    fn test_mret_collapses_mpp_to_machine_without_u_extension() {
        let mut hart = hart_with_ram(0, None);
        hart.csrs.mstatus_set_mpp(crate::PrivilegeLevel::User);
        hart.mret().unwrap();
        assert_eq!(hart.privilege(), crate::PrivilegeLevel::User);
        assert_eq!(hart.csrs().mstatus_mpp(), crate::RawPrivilegeLevel::Machine);
    }

    #[test]
    fn test_csrrs_with_x0_source_does_not_write() {
        let mut hart = hart_with_ram(0, None);
        // csrrs x1, mhartid, x0
        let ins: u32 = (address::MHARTID as u32) << 20 | (0 << 15) | (0b010 << 12) | (1 << 7) | 0b1110011;
        store32(&mut hart, 0, ins);
        assert!(hart.step());
        assert_eq!(hart.registers().x(Specifier::from_u5(1)), 0);
    }

    #[test]
    fn test_tohost_store_terminates_execution() {
        let mut hart = hart_with_ram(0, Some(0x1000));
        hart.registers.set_x(Specifier::from_u5(1), 0x1000);
        hart.registers.set_x(Specifier::from_u5(2), 1);
        // sw x2, 0(x1)
        store32(&mut hart, 0, 0x0020_A023);
        assert!(!hart.step());
        assert_eq!(hart.termination_value(), Some(1));
    }

    #[test]
    fn test_misaligned_load_faults_when_unsupported() {
        let mut hart = hart_with_ram(0, None);
        hart.registers.set_x(Specifier::from_u5(1), 1);
        // ld x2, 0(x1), x1 holds an address that is not 8-byte aligned
        store32(&mut hart, 0, 0x0000_B103);
        assert!(hart.step());
        // The faulting ld should have trapped, landing pc back at mtvec (0), not advanced.
        assert_eq!(hart.registers().pc(), hart.csrs().mtvec_base());
    }
}
