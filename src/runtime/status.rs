//! Wait-status decoding.

use crate::error::{Error, ProcessError, Result};
use crate::trap::{ProgramResult, TrapId};

/// Exit codes at or above this value carry a trap id.
const TRAP_EXIT_BASE: i32 = 100;
const TRAP_EXIT_MAX: i32 = 127;

/// How a program stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub trap: TrapId,
    /// Meaningful when `trap` is `Exit`.
    pub result: ProgramResult,
}

impl Outcome {
    pub fn trap(trap: TrapId) -> Self {
        Self {
            trap,
            result: ProgramResult::default(),
        }
    }

    pub fn exit(result: ProgramResult) -> Self {
        Self {
            trap: TrapId::Exit,
            result,
        }
    }
}

/// Interprets a POSIX wait status reported for a sandboxed process.
pub fn decode(status: i32, kill_requested: bool) -> Result<Outcome> {
    let outcome = if libc::WIFEXITED(status) {
        match libc::WEXITSTATUS(status) {
            code @ 0..=3 => Outcome::exit(ProgramResult::new(code as u32)),
            code @ TRAP_EXIT_BASE..=TRAP_EXIT_MAX => {
                match TrapId::from_u8((code - TRAP_EXIT_BASE) as u8) {
                    Some(trap) => Outcome::trap(trap),
                    None => return Err(Error::Process(ProcessError::from_code(code))),
                }
            }
            code => return Err(Error::Process(ProcessError::from_code(code))),
        }
    } else if libc::WIFSIGNALED(status) {
        match libc::WTERMSIG(status) {
            libc::SIGKILL if kill_requested => Outcome::trap(TrapId::Killed),
            libc::SIGXCPU => Outcome::trap(TrapId::Suspended),
            signal => {
                return Err(Error::Internal(format!(
                    "process terminated by signal {signal}"
                )))
            }
        }
    } else {
        return Err(Error::Internal(format!(
            "unexpected wait status {status:#x}"
        )));
    };

    if kill_requested
        && matches!(
            outcome.trap,
            TrapId::Exit | TrapId::Suspended | TrapId::Breakpoint | TrapId::AbiDeficiency
        )
    {
        return Ok(Outcome::trap(TrapId::Killed));
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn signaled(signal: i32) -> i32 {
        signal & 0x7f
    }

    #[test]
    fn test_program_results() {
        for code in 0..=3 {
            let outcome = decode(exited(code), false).unwrap();
            assert_eq!(outcome.trap, TrapId::Exit);
            assert_eq!(outcome.result.code(), code as u32);
        }
    }

    #[test]
    fn test_trap_exit_codes() {
        assert_eq!(
            decode(exited(100 + 3), false).unwrap().trap,
            TrapId::Unreachable
        );
        assert_eq!(
            decode(exited(100 + 12), false).unwrap().trap,
            TrapId::AbiViolation
        );
        assert!(matches!(
            decode(exited(100 + 20), false),
            Err(Error::Process(_))
        ));
    }

    #[test]
    fn test_loader_error_codes() {
        let err = decode(exited(5), false).unwrap_err();
        match err {
            Error::Process(e) => assert_eq!(e.code(), 5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_signals() {
        assert_eq!(
            decode(signaled(libc::SIGXCPU), false).unwrap().trap,
            TrapId::Suspended
        );
        assert_eq!(
            decode(signaled(libc::SIGKILL), true).unwrap().trap,
            TrapId::Killed
        );
        assert!(matches!(
            decode(signaled(libc::SIGKILL), false),
            Err(Error::Internal(_))
        ));
        assert!(matches!(
            decode(signaled(libc::SIGSEGV), false),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_kill_upgrades_soft_traps() {
        assert_eq!(decode(exited(0), true).unwrap().trap, TrapId::Killed);
        assert_eq!(
            decode(signaled(libc::SIGXCPU), true).unwrap().trap,
            TrapId::Killed
        );
        assert_eq!(
            decode(exited(100 + 10), true).unwrap().trap,
            TrapId::Killed
        );
        // A genuine fault is still reported as such.
        assert_eq!(
            decode(exited(100 + 8), true).unwrap().trap,
            TrapId::IntegerDivideByZero
        );
    }
}
