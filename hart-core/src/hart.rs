//! The hart itself: registers, CSRs, the bus it is wired to, and the fetch-decode-execute loop.

use crate::csr::CsrFile;
use crate::instruction::Instruction;
use crate::registers::Registers;
use crate::system_bus::{BusError, SystemBus};
use crate::trap::Exception;
use crate::{Alignment, PrivilegeLevel};
use log::{debug, trace, warn};

/// How many times in a row the program counter may revisit the same address (a `jal`/`c.j`
/// spinning on itself, the idiomatic way bare-metal test programs park after finishing without a
/// `tohost` handshake) before a diagnostic is logged. Execution is never halted by this; it only
/// helps a human notice a hung simulation in the log.
const SELF_LOOP_WARN_THRESHOLD: u32 = 20;

/// Hart construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub hart_id: u64,
    /// Initial value of `pc`.
    pub reset_vector: u64,
    /// Bitmask latched into `misa.Extensions` at reset.
    pub extensions: u32,
    /// Address of the `tohost` word. A store whose address falls within
    /// `[tohost_address, tohost_address + 8)` is diverted: the write itself never reaches the
    /// bus, and [`Hart::step`] returns `false` with [`Hart::termination_value`] set.
    pub tohost_address: Option<u64>,
    /// If `false`, a misaligned load/store/fetch raises the corresponding `*AddressMisaligned`
    /// exception. If `true`, all accesses are permitted regardless of alignment.
    pub support_misaligned_memory_access: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hart_id: 0,
            reset_vector: 0,
            extensions: 0,
            tohost_address: None,
            support_misaligned_memory_access: false,
        }
    }
}

/// A single RV64I(+Zicsr, partial C) hart: its architectural state plus the bus it is wired to.
#[derive(Debug)]
pub struct Hart {
    pub(crate) registers: Registers,
    pub(crate) csrs: CsrFile,
    pub(crate) bus: SystemBus,
    pub(crate) privilege: PrivilegeLevel,
    config: Config,
    termination_value: Option<u64>,
    last_pc: u64,
    self_loop_count: u32,
}

impl Hart {
    pub fn new(config: Config, bus: SystemBus) -> Self {
        let csrs = CsrFile::new(config.hart_id, config.extensions);
        Self {
            registers: Registers::new(config.reset_vector),
            csrs,
            bus,
            privilege: PrivilegeLevel::Machine,
            last_pc: config.reset_vector,
            self_loop_count: 0,
            config,
            termination_value: None,
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn csrs(&self) -> &CsrFile {
        &self.csrs
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn bus(&self) -> &SystemBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SystemBus {
        &mut self.bus
    }

    /// The value written to `tohost` that caused [`Self::step`] to return `false`, if any.
    pub fn termination_value(&self) -> Option<u64> {
        self.termination_value
    }

    /// Executes one instruction (fetch, decode, execute, writeback), or enters a trap if it
    /// raised an architectural exception.
    ///
    /// Returns `false` once the simulation has terminated: either a `tohost` store was observed
    /// (see [`Self::termination_value`]), or fetching/decoding hit a host-fatal condition this
    /// hart cannot recover from locally.
    pub fn step(&mut self) -> bool {
        if self.termination_value.is_some() {
            return false;
        }
        let pc = self.registers.pc();
        if let Err(exception) = self.step_inner(pc) {
            trace!("trapping at {pc:#x} ({:?}) on {exception:?}", self.privilege);
            self.enter_trap(pc, exception);
        }
        self.csrs.retire_instruction();

        if pc == self.last_pc {
            self.self_loop_count += 1;
            if self.self_loop_count == SELF_LOOP_WARN_THRESHOLD {
                warn!(
                    "hart has been stuck re-executing the instruction at {pc:#x} {} times in a row",
                    self.self_loop_count
                );
            }
        } else {
            self.self_loop_count = 0;
        }
        self.last_pc = pc;

        self.termination_value.is_none()
    }

    fn step_inner(&mut self, pc: u64) -> Result<(), Exception> {
        if !Alignment::HALFWORD.is_aligned(pc) {
            return Err(Exception::InstructionAddressMisaligned(pc));
        }
        let low = self.fetch_u16(pc)?;
        let (instruction, length) = if Instruction::is_compressed(low) {
            let instruction = Instruction::decode_compressed(low)
                .map_err(|_| Exception::IllegalInstruction(Some(low as u32)))?;
            (instruction, 2u64)
        } else {
            let high = self.fetch_u16(pc.wrapping_add(2))?;
            let raw = (low as u32) | ((high as u32) << 16);
            let instruction =
                Instruction::decode(raw).map_err(|_| Exception::IllegalInstruction(Some(raw)))?;
            (instruction, 4u64)
        };
        debug!("{pc:#x}: {instruction:?}");
        // Default fall-through; control-flow instructions overwrite this themselves.
        *self.registers.pc_mut() = pc.wrapping_add(length);
        self.execute(instruction, pc)
    }

    fn fetch_u16(&self, address: u64) -> Result<u16, Exception> {
        self.bus
            .read(address, 2)
            .map(|value| value as u16)
            .map_err(|err| match err {
                BusError::OutOfBounds(_) | BusError::NoDevice(_) => {
                    Exception::InstructionAccessFault(address)
                }
            })
    }

    /// Diverts a store whose address range intersects `tohost`, returning `true` if the write
    /// was diverted (and so must not reach the bus).
    pub(crate) fn maybe_divert_tohost(&mut self, address: u64, size: u8, value: u64) -> bool {
        let Some(tohost) = self.config.tohost_address else {
            return false;
        };
        let end = address.saturating_add(size as u64);
        if address < tohost.saturating_add(8) && end > tohost {
            self.termination_value = Some(value);
            true
        } else {
            false
        }
    }

    pub(crate) fn support_misaligned_memory_access(&self) -> bool {
        self.config.support_misaligned_memory_access
    }

    /// Enters a trap for `exception`, which occurred while `pc` held the value of the
    /// instruction that raised it.
    ///
    /// Every trap is taken into M-mode: `medeleg`/`mideleg` exist as plain CSRs but delegation is
    /// never consulted (see the trap-delegation design note).
    fn enter_trap(&mut self, pc: u64, exception: Exception) {
        self.csrs.set_mepc(pc);
        self.csrs.set_mcause(exception.code());
        self.csrs.set_mtval(exception.tval());

        self.csrs.mstatus_set_mpie(self.csrs.mstatus_mie());
        self.csrs.mstatus_set_mie(false);
        self.csrs.mstatus_set_mpp(self.privilege);

        *self.registers.pc_mut() = self.csrs.mtvec_base();
        self.privilege = PrivilegeLevel::Machine;
    }

    /// `MRET`: returns from an M-mode trap handler.
    pub(crate) fn mret(&mut self) -> Result<(), Exception> {
        if self.privilege != PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction(None));
        }
        *self.registers.pc_mut() = self.csrs.mepc();
        self.csrs.mstatus_set_mie(self.csrs.mstatus_mpie());
        self.csrs.mstatus_set_mpie(true);
        let target = self.csrs.mstatus_mpp();
        self.privilege = PrivilegeLevel::try_from(target).unwrap_or(PrivilegeLevel::User);
        // MPP always collapses back to the lowest privilege level this hart implements: U if
        // the U extension is present, M otherwise (no hypervisor extension, so never S here).
        let lowest = if self.csrs.supports_u_mode() {
            PrivilegeLevel::User
        } else {
            PrivilegeLevel::Machine
        };
        self.csrs.mstatus_set_mpp(lowest);
        Ok(())
    }

    /// `SRET`: returns from an S-mode trap handler. Illegal below Supervisor privilege.
    pub(crate) fn sret(&mut self) -> Result<(), Exception> {
        if self.privilege < PrivilegeLevel::Supervisor {
            return Err(Exception::IllegalInstruction(None));
        }
        *self.registers.pc_mut() = self.csrs.sepc();
        self.csrs.mstatus_set_sie(self.csrs.mstatus_spie());
        self.csrs.mstatus_set_spie(true);
        self.privilege = self.csrs.mstatus_spp();
        self.csrs.mstatus_set_spp(PrivilegeLevel::User);
        Ok(())
    }
}
