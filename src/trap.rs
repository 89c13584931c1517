/// Trap identifiers and program result codes.
///
/// A trap is the reason a program stopped: normal exit, any WebAssembly
/// trap, or an executor condition such as suspension or a kill.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrapId {
    Exit = 0,
    NoFunction = 1,
    Suspended = 2,
    Unreachable = 3,
    CallStackExhausted = 4,
    MemoryAccessOutOfBounds = 5,
    IndirectCallIndexOutOfBounds = 6,
    IndirectCallSignatureMismatch = 7,
    IntegerDivideByZero = 8,
    IntegerOverflow = 9,
    Breakpoint = 10,
    AbiDeficiency = 11,
    AbiViolation = 12,
    InternalError = 13,
    Killed = 14,
}

impl TrapId {
    pub const ALL: [TrapId; 15] = [
        TrapId::Exit,
        TrapId::NoFunction,
        TrapId::Suspended,
        TrapId::Unreachable,
        TrapId::CallStackExhausted,
        TrapId::MemoryAccessOutOfBounds,
        TrapId::IndirectCallIndexOutOfBounds,
        TrapId::IndirectCallSignatureMismatch,
        TrapId::IntegerDivideByZero,
        TrapId::IntegerOverflow,
        TrapId::Breakpoint,
        TrapId::AbiDeficiency,
        TrapId::AbiViolation,
        TrapId::InternalError,
        TrapId::Killed,
    ];

    pub fn from_u8(id: u8) -> Option<TrapId> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrapId::Exit => "exit",
            TrapId::NoFunction => "no function",
            TrapId::Suspended => "suspended",
            TrapId::Unreachable => "unreachable",
            TrapId::CallStackExhausted => "call stack exhausted",
            TrapId::MemoryAccessOutOfBounds => "memory access out of bounds",
            TrapId::IndirectCallIndexOutOfBounds => "indirect call index out of bounds",
            TrapId::IndirectCallSignatureMismatch => "indirect call signature mismatch",
            TrapId::IntegerDivideByZero => "integer divide by zero",
            TrapId::IntegerOverflow => "integer overflow",
            TrapId::Breakpoint => "breakpoint",
            TrapId::AbiDeficiency => "ABI deficiency",
            TrapId::AbiViolation => "ABI violation",
            TrapId::InternalError => "internal error",
            TrapId::Killed => "killed",
        }
    }
}

impl fmt::Display for TrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-bit program result: bit 0 is failure, bit 1 is termination (as
/// opposed to halting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramResult {
    code: u32,
}

impl ProgramResult {
    pub const SUCCESS: ProgramResult = ProgramResult { code: 0 };
    pub const FAILURE: ProgramResult = ProgramResult { code: 1 };

    /// Terminated results are only meaningful for debugging; they cannot be
    /// resumed.
    pub const TERMINATED_SUCCESS: ProgramResult = ProgramResult { code: 2 };
    pub const TERMINATED_FAILURE: ProgramResult = ProgramResult { code: 3 };

    pub fn new(code: u32) -> Self {
        Self { code }
    }

    pub fn code(self) -> u32 {
        self.code
    }

    pub fn value(self) -> u32 {
        self.code & 1
    }

    pub fn terminated(self) -> bool {
        self.code & 2 != 0
    }

    pub fn is_valid(self) -> bool {
        self.code < 4
    }
}

impl fmt::Display for ProgramResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "invalid result {}", self.code);
        }
        let verb = if self.terminated() { "terminated" } else { "halted" };
        write!(f, "{verb} with value {}", self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_ids_are_dense() {
        for (i, trap) in TrapId::ALL.iter().enumerate() {
            assert_eq!(*trap as usize, i);
            assert_eq!(TrapId::from_u8(i as u8), Some(*trap));
        }
        assert_eq!(TrapId::from_u8(15), None);
    }

    #[test]
    fn test_result_bits() {
        for code in 0..4 {
            let result = ProgramResult::new(code);
            assert!(result.is_valid());
            assert_eq!(result.value(), code & 1);
            assert_eq!(result.terminated(), code & 2 != 0);
        }
        assert!(!ProgramResult::new(4).is_valid());
    }

    #[test]
    fn test_result_display() {
        assert_eq!(ProgramResult::SUCCESS.to_string(), "halted with value 0");
        assert_eq!(
            ProgramResult::TERMINATED_FAILURE.to_string(),
            "terminated with value 1"
        );
        assert_eq!(ProgramResult::new(7).to_string(), "invalid result 7");
    }

    #[test]
    fn test_trap_display() {
        assert_eq!(TrapId::AbiViolation.to_string(), "ABI violation");
        assert_eq!(TrapId::Killed.to_string(), "killed");
    }
}
