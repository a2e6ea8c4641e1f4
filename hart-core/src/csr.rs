//! Control and Status Registers ("Zicsr").
//!
//! > RISC-V defines a separate address space of 4096 Control and Status registers associated
//! > with each hart. [...] By convention, the upper 4 bits of the CSR address (csr\[11:8]) are
//! > used to encode the read and write accessibility of the CSRs according to privilege level.
//! > The top two bits (csr\[11:10]) indicate whether the register is read/write (00, 01, or 10)
//! > or read-only (11). The next two bits (csr\[9:8]) encode the lowest privilege level that can
//! > access the CSR.
//!
//! Unlike [`bus`](crate::bus) or [`system_bus`](crate::system_bus) failures, a bad CSR access
//! (nonexistent address, insufficient privilege, write to a read-only register) is not a host
//! error: it raises [`Exception::IllegalInstruction`], recovered the same way as any other
//! architectural exception.

use crate::bitfield::BlockRegister;
use crate::trap::Exception;
use crate::{PrivilegeLevel, RawPrivilegeLevel};

/// A 12-bit CSR address. Not every value in `0..4096` names an implemented register.
pub type CsrAddress = u16;

pub mod address {
    use super::CsrAddress;

    pub const MSTATUS: CsrAddress = 0x300;
    pub const MISA: CsrAddress = 0x301;
    pub const MEDELEG: CsrAddress = 0x302;
    pub const MIDELEG: CsrAddress = 0x303;
    pub const MIE: CsrAddress = 0x304;
    pub const MTVEC: CsrAddress = 0x305;
    pub const MCOUNTEREN: CsrAddress = 0x306;
    pub const MSCRATCH: CsrAddress = 0x340;
    pub const MEPC: CsrAddress = 0x341;
    pub const MCAUSE: CsrAddress = 0x342;
    pub const MTVAL: CsrAddress = 0x343;
    pub const MIP: CsrAddress = 0x344;
    pub const PMPCFG0: CsrAddress = 0x3A0;
    pub const PMPADDR0: CsrAddress = 0x3B0;
    pub const MNSTATUS: CsrAddress = 0x744;
    pub const MCYCLE: CsrAddress = 0xB00;
    pub const MINSTRET: CsrAddress = 0xB02;
    pub const CYCLE: CsrAddress = 0xC00;
    pub const TIME: CsrAddress = 0xC01;
    pub const INSTRET: CsrAddress = 0xC02;
    pub const MVENDORID: CsrAddress = 0xF11;
    pub const MARCHID: CsrAddress = 0xF12;
    pub const MIMPID: CsrAddress = 0xF13;
    pub const MHARTID: CsrAddress = 0xF14;
    pub const MCONFIGPTR: CsrAddress = 0xF15;

    pub const SSTATUS: CsrAddress = 0x100;
    pub const SIE: CsrAddress = 0x104;
    pub const STVEC: CsrAddress = 0x105;
    pub const SCOUNTEREN: CsrAddress = 0x106;
    pub const SSCRATCH: CsrAddress = 0x140;
    pub const SEPC: CsrAddress = 0x141;
    pub const SCAUSE: CsrAddress = 0x142;
    pub const STVAL: CsrAddress = 0x143;
    pub const SIP: CsrAddress = 0x144;
    pub const SATP: CsrAddress = 0x180;
}

mod mstatus_field {
    use crate::bitfield::FieldSpec;

    pub const SIE: FieldSpec = FieldSpec::bit("SIE", 1);
    pub const MIE: FieldSpec = FieldSpec::bit("MIE", 3);
    pub const SPIE: FieldSpec = FieldSpec::bit("SPIE", 5);
    pub const MPIE: FieldSpec = FieldSpec::bit("MPIE", 7);
    pub const SPP: FieldSpec = FieldSpec::bit("SPP", 8);
    pub const MPP: FieldSpec = FieldSpec::new("MPP", 12, 11);
    pub const SUM: FieldSpec = FieldSpec::bit("SUM", 18);
    pub const MXR: FieldSpec = FieldSpec::bit("MXR", 19);
    pub const UXL: FieldSpec = FieldSpec::new("UXL", 33, 32);
    pub const SXL: FieldSpec = FieldSpec::new("SXL", 35, 34);
    pub const SD: FieldSpec = FieldSpec::bit("SD", 63);

    pub const ALL: &[FieldSpec] = &[SIE, MIE, SPIE, MPIE, SPP, MPP, SUM, MXR, UXL, SXL, SD];
}

/// Bits of `mstatus` that are also visible (and independently read/writable) through `sstatus`.
const SSTATUS_MASK: u64 =
    (1 << 1) | (1 << 5) | (1 << 8) | (1 << 18) | (1 << 19) | (0b11 << 32) | (1 << 63);

/// Bits of `mie`/`mip` that are also visible through `sie`/`sip` (`SSIE`, `STIE`, `SEIE`).
const S_INTERRUPT_MASK: u64 = (1 << 1) | (1 << 5) | (1 << 9);

mod misa_field {
    use crate::bitfield::FieldSpec;

    pub const EXTENSIONS: FieldSpec = FieldSpec::new("EXTENSIONS", 25, 0);
    pub const MXL: FieldSpec = FieldSpec::new("MXL", 63, 62);

    pub const ALL: &[FieldSpec] = &[EXTENSIONS, MXL];
}

/// `MXL = 2` encodes `XLEN = 64` in `misa`.
const MISA_MXL_RV64: u64 = 2;

/// Bit index of extension letter `U` within `misa.Extensions` (`'U' - 'A'`).
const MISA_EXT_U: u64 = 20;

/// All Control and Status Registers of a single hart.
#[derive(Debug, Clone)]
pub struct CsrFile {
    hart_id: u64,
    mstatus: BlockRegister,
    /// WARL: bits actually implemented at construction time; writes are masked to this set.
    misa: BlockRegister,
    medeleg: u64,
    mideleg: u64,
    mie: u64,
    mip: u64,
    mtvec: u64,
    mscratch: u64,
    mepc: u64,
    mcause: u64,
    mtval: u64,
    mcounteren: u64,
    pmpcfg0: u64,
    pmpaddr0: u64,
    mnstatus: u64,
    mcycle: u64,
    minstret: u64,
    stvec: u64,
    scounteren: u64,
    sscratch: u64,
    sepc: u64,
    scause: u64,
    stval: u64,
}

impl CsrFile {
    /// Creates a fresh CSR file with `hart_id` latched into `mhartid` and the given set of
    /// implemented extension letters latched into `misa.Extensions`.
    pub fn new(hart_id: u64, extensions: u32) -> Self {
        let mut misa = BlockRegister::new(64, misa_field::ALL);
        misa.set_field("MXL", MISA_MXL_RV64).unwrap();
        misa.set_field("EXTENSIONS", extensions as u64).unwrap();
        Self {
            hart_id,
            mstatus: BlockRegister::new(64, mstatus_field::ALL),
            misa,
            medeleg: 0,
            mideleg: 0,
            mie: 0,
            mip: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            mcounteren: 0,
            pmpcfg0: 0,
            pmpaddr0: 0,
            mnstatus: 0,
            mcycle: 0,
            minstret: 0,
            stvec: 0,
            scounteren: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
        }
    }

    /// Returns `(read_only, required_level)` as encoded by `csr[11:10]` / `csr[9:8]`.
    fn classify(addr: CsrAddress) -> (bool, RawPrivilegeLevel) {
        let read_only = (addr >> 10) & 0b11 == 0b11;
        let required_level = RawPrivilegeLevel::from_u2(((addr >> 8) & 0b11) as u8);
        (read_only, required_level)
    }

    fn check_access(
        addr: CsrAddress,
        privilege: PrivilegeLevel,
        for_write: bool,
    ) -> Result<(), Exception> {
        let (read_only, required_level) = Self::classify(addr);
        if !Self::is_implemented(addr) {
            return Err(Exception::IllegalInstruction(None));
        }
        if for_write && read_only {
            return Err(Exception::IllegalInstruction(None));
        }
        if privilege < required_level {
            return Err(Exception::IllegalInstruction(None));
        }
        Ok(())
    }

    fn is_implemented(addr: CsrAddress) -> bool {
        use address::*;
        matches!(
            addr,
            MSTATUS
                | MISA
                | MEDELEG
                | MIDELEG
                | MIE
                | MTVEC
                | MCOUNTEREN
                | MSCRATCH
                | MEPC
                | MCAUSE
                | MTVAL
                | MIP
                | PMPCFG0
                | PMPADDR0
                | MNSTATUS
                | MCYCLE
                | MINSTRET
                | CYCLE
                | TIME
                | INSTRET
                | MVENDORID
                | MARCHID
                | MIMPID
                | MHARTID
                | MCONFIGPTR
                | SSTATUS
                | SIE
                | STVEC
                | SCOUNTEREN
                | SSCRATCH
                | SEPC
                | SCAUSE
                | STVAL
                | SIP
                | SATP
        )
    }

    /// Reads a CSR, honoring its encoded privilege requirement.
    pub fn get(&self, addr: CsrAddress, privilege: PrivilegeLevel) -> Result<u64, Exception> {
        Self::check_access(addr, privilege, false)?;
        use address::*;
        Ok(match addr {
            MSTATUS => self.mstatus.all(),
            MISA => self.misa.all(),
            MEDELEG => self.medeleg,
            MIDELEG => self.mideleg,
            MIE => self.mie,
            MTVEC => self.mtvec,
            MCOUNTEREN => self.mcounteren,
            MSCRATCH => self.mscratch,
            MEPC => self.mepc,
            MCAUSE => self.mcause,
            MTVAL => self.mtval,
            MIP => self.mip,
            PMPCFG0 => self.pmpcfg0,
            PMPADDR0 => self.pmpaddr0,
            MNSTATUS => self.mnstatus,
            MCYCLE | CYCLE => self.mcycle,
            MINSTRET | INSTRET => self.minstret,
            TIME => self.mcycle,
            MVENDORID | MARCHID | MIMPID | MCONFIGPTR => 0,
            MHARTID => self.hart_id,
            SSTATUS => self.mstatus.all() & SSTATUS_MASK,
            SIE => self.mie & S_INTERRUPT_MASK,
            STVEC => self.stvec,
            SCOUNTEREN => self.scounteren,
            SSCRATCH => self.sscratch,
            SEPC => self.sepc,
            SCAUSE => self.scause,
            STVAL => self.stval,
            SIP => self.mip & S_INTERRUPT_MASK,
            // satp is WARL and only Bare mode is implemented: always reads as 0.
            SATP => 0,
            _ => unreachable!("is_implemented guards every reachable address"),
        })
    }

    /// Writes a CSR, honoring its encoded privilege requirement and read-only bit.
    pub fn set(
        &mut self,
        addr: CsrAddress,
        value: u64,
        privilege: PrivilegeLevel,
    ) -> Result<(), Exception> {
        Self::check_access(addr, privilege, true)?;
        use address::*;
        match addr {
            MSTATUS => self.mstatus.set_all(value),
            // misa is WARL: the implementation only ever supports the extension set it was
            // constructed with, so writes are accepted but silently ignored.
            MISA => {}
            MEDELEG => self.medeleg = value,
            MIDELEG => self.mideleg = value,
            MIE => self.mie = value,
            MTVEC => self.mtvec = value,
            MCOUNTEREN => self.mcounteren = value,
            MSCRATCH => self.mscratch = value,
            MEPC => self.mepc = value & !1,
            MCAUSE => self.mcause = value,
            MTVAL => self.mtval = value,
            MIP => self.mip = value,
            PMPCFG0 => self.pmpcfg0 = value,
            PMPADDR0 => self.pmpaddr0 = value,
            MNSTATUS => self.mnstatus = value,
            MCYCLE => self.mcycle = value,
            MINSTRET => self.minstret = value,
            SSTATUS => {
                let base = self.mstatus.all() & !SSTATUS_MASK;
                self.mstatus.set_all(base | (value & SSTATUS_MASK));
            }
            SIE => self.mie = (self.mie & !S_INTERRUPT_MASK) | (value & S_INTERRUPT_MASK),
            STVEC => self.stvec = value,
            SCOUNTEREN => self.scounteren = value,
            SSCRATCH => self.sscratch = value,
            SEPC => self.sepc = value & !1,
            SCAUSE => self.scause = value,
            STVAL => self.stval = value,
            SIP => self.mip = (self.mip & !S_INTERRUPT_MASK) | (value & S_INTERRUPT_MASK),
            // satp is WARL, collapsed to Bare mode only: writes are accepted but ignored.
            SATP => {}
            _ => unreachable!("is_implemented guards every reachable address"),
        }
        Ok(())
    }

    /// Advances the cycle and instruction-retired counters by one. Called once per
    /// successfully-retired instruction.
    pub fn retire_instruction(&mut self) {
        self.mcycle = self.mcycle.wrapping_add(1);
        self.minstret = self.minstret.wrapping_add(1);
    }

    /// Whether the `U` extension was latched into `misa.Extensions` at construction.
    pub fn supports_u_mode(&self) -> bool {
        self.misa.field("EXTENSIONS").unwrap() & (1 << MISA_EXT_U) != 0
    }

    pub fn mstatus_mie(&self) -> bool {
        self.mstatus.field("MIE").unwrap() != 0
    }

    pub fn mstatus_set_mie(&mut self, value: bool) {
        self.mstatus.set_field("MIE", value as u64).unwrap();
    }

    pub fn mstatus_mpie(&self) -> bool {
        self.mstatus.field("MPIE").unwrap() != 0
    }

    pub fn mstatus_set_mpie(&mut self, value: bool) {
        self.mstatus.set_field("MPIE", value as u64).unwrap();
    }

    pub fn mstatus_mpp(&self) -> RawPrivilegeLevel {
        RawPrivilegeLevel::from_u2(self.mstatus.field("MPP").unwrap() as u8)
    }

    pub fn mstatus_set_mpp(&mut self, level: PrivilegeLevel) {
        self.mstatus
            .set_field("MPP", RawPrivilegeLevel::from(level) as u64)
            .unwrap();
    }

    pub fn mstatus_sie(&self) -> bool {
        self.mstatus.field("SIE").unwrap() != 0
    }

    pub fn mstatus_set_sie(&mut self, value: bool) {
        self.mstatus.set_field("SIE", value as u64).unwrap();
    }

    pub fn mstatus_spie(&self) -> bool {
        self.mstatus.field("SPIE").unwrap() != 0
    }

    pub fn mstatus_set_spie(&mut self, value: bool) {
        self.mstatus.set_field("SPIE", value as u64).unwrap();
    }

    pub fn mstatus_spp(&self) -> PrivilegeLevel {
        match self.mstatus.field("SPP").unwrap() {
            0 => PrivilegeLevel::User,
            _ => PrivilegeLevel::Supervisor,
        }
    }

    pub fn mstatus_set_spp(&mut self, level: PrivilegeLevel) {
        let bit = matches!(level, PrivilegeLevel::Supervisor) as u64;
        self.mstatus.set_field("SPP", bit).unwrap();
    }

    /// `mtvec`'s base address, with the `MODE` field masked out. The `MODE` field itself is
    /// read/written but otherwise unconsulted (see the trap-dispatch design note).
    pub fn mtvec_base(&self) -> u64 {
        self.mtvec & !0b11
    }

    pub fn stvec_base(&self) -> u64 {
        self.stvec & !0b11
    }

    pub fn mepc(&self) -> u64 {
        self.mepc
    }

    pub fn set_mepc(&mut self, value: u64) {
        self.mepc = value;
    }

    pub fn set_mcause(&mut self, value: u64) {
        self.mcause = value;
    }

    pub fn set_mtval(&mut self, value: u64) {
        self.mtval = value;
    }

    pub fn sepc(&self) -> u64 {
        self.sepc
    }

    pub fn set_sepc(&mut self, value: u64) {
        self.sepc = value;
    }

    pub fn set_scause(&mut self, value: u64) {
        self.scause = value;
    }

    pub fn set_stval(&mut self, value: u64) {
        self.stval = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mhartid_is_read_only() {
        let csrs = CsrFile::new(3, 0);
        assert_eq!(csrs.get(address::MHARTID, PrivilegeLevel::Machine).unwrap(), 3);
        let mut csrs = csrs;
        assert!(matches!(
            csrs.set(address::MHARTID, 9, PrivilegeLevel::Machine),
            Err(Exception::IllegalInstruction(None))
        ));
    }

    #[test]
    fn test_unimplemented_csr_is_illegal_instruction() {
        let csrs = CsrFile::new(0, 0);
        assert!(matches!(
            csrs.get(0x7FF, PrivilegeLevel::Machine),
            Err(Exception::IllegalInstruction(None))
        ));
    }

    #[test]
    fn test_supervisor_csr_rejected_from_user_mode() {
        let csrs = CsrFile::new(0, 0);
        assert!(matches!(
            csrs.get(address::SSTATUS, PrivilegeLevel::User),
            Err(Exception::IllegalInstruction(None))
        ));
    }

    #[test]
    fn test_sstatus_is_a_masked_view_of_mstatus() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.mstatus_set_mie(true);
        csrs.mstatus_set_sie(true);
        let sstatus = csrs.get(address::SSTATUS, PrivilegeLevel::Supervisor).unwrap();
        // SIE (bit 1) is visible through sstatus, MIE (bit 3) is not.
        assert_eq!(sstatus & 0b10, 0b10);
        assert_eq!(sstatus & 0b1000, 0);
    }

    #[test]
    fn test_sstatus_write_does_not_disturb_machine_only_bits() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.mstatus_set_mie(true);
        csrs.set(address::SSTATUS, 0, PrivilegeLevel::Supervisor).unwrap();
        assert!(csrs.mstatus_mie());
    }

    #[test]
    fn test_misa_mxl_is_rv64() {
        let csrs = CsrFile::new(0, 0b01 << 8 | 1);
        let misa = csrs.get(address::MISA, PrivilegeLevel::Machine).unwrap();
        assert_eq!(misa >> 62, 2);
    }

    #[test]
    fn test_supports_u_mode_reflects_misa_extensions() {
        let without_u = CsrFile::new(0, 0);
        assert!(!without_u.supports_u_mode());
        let with_u = CsrFile::new(0, 1 << 20);
        assert!(with_u.supports_u_mode());
    }

    #[test]
    fn test_mnstatus_is_plain_machine_mode_storage() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.set(address::MNSTATUS, 0x8, PrivilegeLevel::Machine)
            .unwrap();
        assert_eq!(csrs.get(address::MNSTATUS, PrivilegeLevel::Machine).unwrap(), 0x8);
        assert!(matches!(
            csrs.get(address::MNSTATUS, PrivilegeLevel::Supervisor),
            Err(Exception::IllegalInstruction(None))
        ));
    }

    #[test]
    fn test_satp_is_bare_only() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.set(address::SATP, 0xFFFF_FFFF, PrivilegeLevel::Machine)
            .unwrap();
        assert_eq!(csrs.get(address::SATP, PrivilegeLevel::Machine).unwrap(), 0);
    }

    #[test]
    fn test_mepc_write_clears_low_bit() {
        let mut csrs = CsrFile::new(0, 0);
        csrs.set(address::MEPC, 0x8000_0003, PrivilegeLevel::Machine)
            .unwrap();
        assert_eq!(csrs.mepc(), 0x8000_0002);
    }
}
