//! Trap cause taxonomy and the fault value that carries an exception from the
//! point of detection back to the dispatch loop.

use thiserror::Error;

use super::mmu::AccessType;

/// Bit 63 of xcause marks an interrupt.
pub const INTERRUPT_BIT: u64 = 1 << 63;

/// Synchronous exception causes (xcause with the interrupt bit clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadMisaligned = 4,
    LoadAccessFault = 5,
    StoreMisaligned = 6,
    StoreAccessFault = 7,
    EcallFromU = 8,
    EcallFromS = 9,
    EcallFromVS = 10,
    EcallFromM = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
    InstructionGuestPageFault = 20,
    LoadGuestPageFault = 21,
    VirtualInstruction = 22,
    StoreGuestPageFault = 23,
}

impl Exception {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn is_guest_page_fault(self) -> bool {
        matches!(
            self,
            Self::InstructionGuestPageFault | Self::LoadGuestPageFault | Self::StoreGuestPageFault
        )
    }

    pub fn is_page_fault(self) -> bool {
        matches!(
            self,
            Self::InstructionPageFault | Self::LoadPageFault | Self::StorePageFault
        )
    }

    /// Faults whose tval is the faulting virtual address.
    pub fn records_address(self) -> bool {
        matches!(
            self,
            Self::InstructionMisaligned
                | Self::InstructionAccessFault
                | Self::LoadMisaligned
                | Self::LoadAccessFault
                | Self::StoreMisaligned
                | Self::StoreAccessFault
        ) || self.is_page_fault()
            || self.is_guest_page_fault()
    }

    /// Page fault for an access kind. Atomics that fail as reads report a
    /// store/AMO fault.
    pub fn page_fault(access: AccessType, amo: bool) -> Self {
        match access {
            AccessType::Execute => Self::InstructionPageFault,
            AccessType::Read if !amo => Self::LoadPageFault,
            _ => Self::StorePageFault,
        }
    }

    pub fn guest_page_fault(access: AccessType, amo: bool) -> Self {
        match access {
            AccessType::Execute => Self::InstructionGuestPageFault,
            AccessType::Read if !amo => Self::LoadGuestPageFault,
            _ => Self::StoreGuestPageFault,
        }
    }

    pub fn access_fault(access: AccessType, amo: bool) -> Self {
        match access {
            AccessType::Execute => Self::InstructionAccessFault,
            AccessType::Read if !amo => Self::LoadAccessFault,
            _ => Self::StoreAccessFault,
        }
    }

    pub fn misaligned(access: AccessType, amo: bool) -> Self {
        match access {
            AccessType::Execute => Self::InstructionMisaligned,
            AccessType::Read if !amo => Self::LoadMisaligned,
            _ => Self::StoreMisaligned,
        }
    }
}

/// Interrupt sources by their mip/mie bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoftware = 1,
    VirtualSupervisorSoftware = 2,
    MachineSoftware = 3,
    SupervisorTimer = 5,
    VirtualSupervisorTimer = 6,
    MachineTimer = 7,
    SupervisorExternal = 9,
    VirtualSupervisorExternal = 10,
    MachineExternal = 11,
    SupervisorGuestExternal = 12,
    CounterOverflow = 13,
}

impl Interrupt {
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn mask(self) -> u64 {
        1 << self.code()
    }

    /// Code reported in vscause: VS-level sources appear as their S-level
    /// counterparts inside the guest.
    pub fn guest_code(self) -> u64 {
        match self {
            Self::VirtualSupervisorSoftware
            | Self::VirtualSupervisorTimer
            | Self::VirtualSupervisorExternal => self.code() - 1,
            _ => self.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl TrapCause {
    /// Raw xcause value.
    pub fn to_xcause(self) -> u64 {
        match self {
            Self::Exception(e) => e.code(),
            Self::Interrupt(i) => INTERRUPT_BIT | i.code(),
        }
    }

    pub fn is_interrupt(self) -> bool {
        matches!(self, Self::Interrupt(_))
    }

    /// Bit position used to index the delegation registers.
    pub fn bit(self) -> u64 {
        match self {
            Self::Exception(e) => e.code(),
            Self::Interrupt(i) => i.code(),
        }
    }
}

impl From<Exception> for TrapCause {
    fn from(e: Exception) -> Self {
        Self::Exception(e)
    }
}

impl From<Interrupt> for TrapCause {
    fn from(i: Interrupt) -> Self {
        Self::Interrupt(i)
    }
}

/// An exception raised somewhere in the translate/check pipeline.
///
/// `tval` is the faulting virtual address for address-type causes (or the
/// instruction bits for illegal-instruction causes). `tval2` holds the
/// guest-physical address already shifted right by 2, and is only meaningful
/// for guest-page faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{cause:?} (tval={tval:#x}, tval2={tval2:#x})")]
pub struct Fault {
    pub cause: Exception,
    pub tval: u64,
    pub tval2: u64,
}

impl Fault {
    pub fn new(cause: Exception, tval: u64) -> Self {
        Self {
            cause,
            tval,
            tval2: 0,
        }
    }

    pub fn guest(cause: Exception, vaddr: u64, gpa: u64) -> Self {
        Self {
            cause,
            tval: vaddr,
            tval2: gpa >> 2,
        }
    }
}
