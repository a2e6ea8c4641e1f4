//! Architectural exceptions and the trap-cause encoding used by `mcause`/`scause`.

/// Result of executing a single instruction: [`Ok`] if execution completed normally, [`Err`] if
/// an architectural exception was raised.
///
/// Unlike a host error, an `Exception` never escapes [`Hart::step`](crate::hart::Hart::step): it
/// is always caught and turned into a trap into the configured handler.
pub type ExecutionResult<T = ()> = Result<T, Exception>;

/// One of the architectural exceptions this hart can raise.
///
/// > When a trap is taken into M-mode, mepc is written with the virtual address of the
/// > instruction that was interrupted or that encountered the exception. ... mcause is written
/// > with a code indicating the event that caused the trap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not on a four-byte (or two-byte, with RVC) aligned boundary.
    ///
    /// The inner value is the faulting virtual address.
    InstructionAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    InstructionAccessFault(u64),
    /// Generic exception used to communicate one of many possible scenarios:
    ///
    /// - (*UNSPECIFIED*) Attempt to decode a reserved or unimplemented instruction.
    /// - Attempt to access a non-existent CSR.
    /// - Attempt to access a CSR without the appropriate privilege level.
    /// - Attempt to write to a read-only CSR.
    /// - `SRET` attempted below Supervisor privilege.
    ///
    /// The inner value is the raw instruction if that data was available.
    IllegalInstruction(Option<u32>),
    Breakpoint,
    /// The inner value is the faulting virtual address.
    LoadAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    LoadAccessFault(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoAccessFault(u64),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
    /// The inner value is the faulting virtual address.
    InstructionPageFault(u64),
    /// The inner value is the faulting virtual address.
    LoadPageFault(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoPageFault(u64),
}

impl Exception {
    pub const INSTRUCTION_ADDRESS_MISALIGNED: u64 = 0;
    pub const INSTRUCTION_ACCESS_FAULT: u64 = 1;
    pub const ILLEGAL_INSTRUCTION: u64 = 2;
    pub const BREAKPOINT: u64 = 3;
    pub const LOAD_ADDRESS_MISALIGNED: u64 = 4;
    pub const LOAD_ACCESS_FAULT: u64 = 5;
    pub const STORE_OR_AMO_ADDRESS_MISALIGNED: u64 = 6;
    pub const STORE_OR_AMO_ACCESS_FAULT: u64 = 7;
    pub const ENVIRONMENT_CALL_FROM_U_MODE: u64 = 8;
    pub const ENVIRONMENT_CALL_FROM_S_MODE: u64 = 9;
    pub const ENVIRONMENT_CALL_FROM_M_MODE: u64 = 11;
    pub const INSTRUCTION_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_OR_AMO_PAGE_FAULT: u64 = 15;

    /// Returns the exception code written to `mcause`/`scause` (with the interrupt bit clear).
    pub const fn code(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(_) => Self::INSTRUCTION_ADDRESS_MISALIGNED,
            Self::InstructionAccessFault(_) => Self::INSTRUCTION_ACCESS_FAULT,
            Self::IllegalInstruction(_) => Self::ILLEGAL_INSTRUCTION,
            Self::Breakpoint => Self::BREAKPOINT,
            Self::LoadAddressMisaligned(_) => Self::LOAD_ADDRESS_MISALIGNED,
            Self::LoadAccessFault(_) => Self::LOAD_ACCESS_FAULT,
            Self::StoreOrAmoAddressMisaligned(_) => Self::STORE_OR_AMO_ADDRESS_MISALIGNED,
            Self::StoreOrAmoAccessFault(_) => Self::STORE_OR_AMO_ACCESS_FAULT,
            Self::EnvironmentCallFromUMode => Self::ENVIRONMENT_CALL_FROM_U_MODE,
            Self::EnvironmentCallFromSMode => Self::ENVIRONMENT_CALL_FROM_S_MODE,
            Self::EnvironmentCallFromMMode => Self::ENVIRONMENT_CALL_FROM_M_MODE,
            Self::InstructionPageFault(_) => Self::INSTRUCTION_PAGE_FAULT,
            Self::LoadPageFault(_) => Self::LOAD_PAGE_FAULT,
            Self::StoreOrAmoPageFault(_) => Self::STORE_OR_AMO_PAGE_FAULT,
        }
    }

    /// The value latched into `mtval`/`stval` for this exception, or `0` if it carries none.
    pub const fn tval(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(addr)
            | Self::InstructionAccessFault(addr)
            | Self::LoadAddressMisaligned(addr)
            | Self::LoadAccessFault(addr)
            | Self::StoreOrAmoAddressMisaligned(addr)
            | Self::StoreOrAmoAccessFault(addr)
            | Self::InstructionPageFault(addr)
            | Self::LoadPageFault(addr)
            | Self::StoreOrAmoPageFault(addr) => *addr,
            Self::IllegalInstruction(Some(raw)) => *raw as u64,
            _ => 0,
        }
    }

    /// `ECALL` for the given privilege level.
    pub const fn ecall_from(privilege: crate::PrivilegeLevel) -> Self {
        match privilege {
            crate::PrivilegeLevel::User => Self::EnvironmentCallFromUMode,
            crate::PrivilegeLevel::Supervisor => Self::EnvironmentCallFromSMode,
            crate::PrivilegeLevel::Machine => Self::EnvironmentCallFromMMode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_codes_match_the_privileged_spec() {
        assert_eq!(Exception::IllegalInstruction(None).code(), 2);
        assert_eq!(Exception::EnvironmentCallFromMMode.code(), 11);
        assert_eq!(Exception::StoreOrAmoPageFault(0).code(), 15);
    }

    #[test]
    fn test_tval_carries_faulting_address() {
        assert_eq!(Exception::LoadAccessFault(0x8000_0004).tval(), 0x8000_0004);
        assert_eq!(Exception::Breakpoint.tval(), 0);
    }

    #[test]
    fn test_ecall_from_selects_cause_by_privilege() {
        assert_eq!(
            Exception::ecall_from(crate::PrivilegeLevel::Machine).code(),
            11
        );
        assert_eq!(
            Exception::ecall_from(crate::PrivilegeLevel::Supervisor).code(),
            9
        );
        assert_eq!(
            Exception::ecall_from(crate::PrivilegeLevel::User).code(),
            8
        );
    }
}
