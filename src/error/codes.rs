//! Numeric exit codes reported by the container and by sandboxed processes.
//!
//! The container binary exits with one of the [`ContainerError`] codes when
//! its setup or its executor loop fails. A sandboxed process that cannot
//! even reach the WebAssembly entry point exits with one of the
//! [`ProcessError`] codes (the range below the trap codes).

use std::fmt;

macro_rules! error_codes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($code:literal => $variant:ident($tag:literal, $msg:literal),)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant,)*
            Unknown(i32),
        }

        impl $name {
            pub fn from_code(code: i32) -> Self {
                match code {
                    $($code => Self::$variant,)*
                    other => Self::Unknown(other),
                }
            }

            pub fn code(self) -> i32 {
                match self {
                    $(Self::$variant => $code,)*
                    Self::Unknown(code) => code,
                }
            }

            /// Stable string tag, e.g. `"ERR_CONT_UNSHARE_USER"`.
            pub fn tag(self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)*
                    Self::Unknown(_) => "ERR_UNKNOWN",
                }
            }

            pub fn message(self) -> &'static str {
                match self {
                    $(Self::$variant => $msg,)*
                    Self::Unknown(_) => "unknown error",
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let message = self.message();
                if message.is_empty() {
                    write!(f, "{} ({})", self.tag(), self.code())
                } else {
                    write!(f, "{} ({}): {message}", self.tag(), self.code())
                }
            }
        }
    };
}

error_codes! {
    /// Exit codes of the container process.
    ///
    /// Code 1 means the container already wrote a message to its stderr, so
    /// it carries no message of its own.
    pub enum ContainerError {
        1 => Stderr("ERR_CONT_STDERR", ""),
        10 => PrctlNoNewPrivs("ERR_CONT_PRCTL_NO_NEW_PRIVS", "prctl PR_SET_NO_NEW_PRIVS failed"),
        11 => PrctlParentDeathSignal("ERR_CONT_PRCTL_PDEATHSIG", "prctl PR_SET_PDEATHSIG failed"),
        12 => PrctlDumpable("ERR_CONT_PRCTL_DUMPABLE", "prctl PR_SET_DUMPABLE failed"),
        13 => PrctlKeepCaps("ERR_CONT_PRCTL_KEEPCAPS", "prctl PR_SET_KEEPCAPS failed"),
        14 => ParentChanged("ERR_CONT_GETPPID", "parent process changed"),
        15 => SignalMask("ERR_CONT_SIGMASK", "setting signal mask failed"),
        16 => SignalAction("ERR_CONT_SIGACTION", "installing signal handler failed"),
        17 => Setsid("ERR_CONT_SETSID", "setsid failed"),
        18 => CloseFds("ERR_CONT_CLOSE_FDS", "closing inherited descriptors failed"),
        19 => ControlFd("ERR_CONT_CONTROL_FD", "control descriptor is not a socket"),
        20 => UnshareUser("ERR_CONT_UNSHARE_USER", "creating user namespace failed"),
        21 => UnshareMount("ERR_CONT_UNSHARE_MOUNT", "creating mount namespace failed"),
        22 => UnsharePid("ERR_CONT_UNSHARE_PID", "creating pid namespace failed"),
        23 => UnshareNet("ERR_CONT_UNSHARE_NET", "creating network namespace failed"),
        24 => UnshareIpc("ERR_CONT_UNSHARE_IPC", "creating ipc namespace failed"),
        25 => UnshareUts("ERR_CONT_UNSHARE_UTS", "creating uts namespace failed"),
        26 => UnshareCgroup("ERR_CONT_UNSHARE_CGROUP", "creating cgroup namespace failed"),
        27 => UidMap("ERR_CONT_UID_MAP", "writing uid_map failed"),
        28 => GidMap("ERR_CONT_GID_MAP", "writing gid_map failed"),
        29 => SetgroupsDeny("ERR_CONT_SETGROUPS_DENY", "writing setgroups failed"),
        30 => NewUidMap("ERR_CONT_NEWUIDMAP", "newuidmap failed"),
        31 => NewGidMap("ERR_CONT_NEWGIDMAP", "newgidmap failed"),
        32 => Setuid("ERR_CONT_SETUID", "setuid failed"),
        33 => Setgid("ERR_CONT_SETGID", "setgid failed"),
        34 => Setgroups("ERR_CONT_SETGROUPS", "setgroups failed"),
        35 => Capset("ERR_CONT_CAPSET", "dropping capabilities failed"),
        36 => MountPrivate("ERR_CONT_MOUNT_PRIVATE", "making mounts private failed"),
        37 => MountTmpfs("ERR_CONT_MOUNT_TMPFS", "mounting tmpfs failed"),
        38 => MountProc("ERR_CONT_MOUNT_PROC", "mounting proc failed"),
        39 => Mkdir("ERR_CONT_MKDIR", "creating directory failed"),
        40 => PivotRoot("ERR_CONT_PIVOT_ROOT", "pivot_root failed"),
        41 => UmountOldRoot("ERR_CONT_UMOUNT_OLD_ROOT", "unmounting old root failed"),
        42 => Chdir("ERR_CONT_CHDIR", "chdir failed"),
        43 => Chroot("ERR_CONT_CHROOT", "chroot failed"),
        44 => RemountReadOnly("ERR_CONT_REMOUNT_RDONLY", "remounting root read-only failed"),
        45 => Sethostname("ERR_CONT_SETHOSTNAME", "sethostname failed"),
        46 => Setdomainname("ERR_CONT_SETDOMAINNAME", "setdomainname failed"),
        47 => CgroupOpen("ERR_CONT_CGROUP_OPEN", "opening cgroup directory failed"),
        48 => CgroupAttach("ERR_CONT_CGROUP_ATTACH", "moving container into cgroup failed"),
        49 => Rlimit("ERR_CONT_RLIMIT", "setting resource limits failed"),
        50 => Fork("ERR_EXEC_FORK", "forking sandbox process failed"),
        51 => Clone3("ERR_EXEC_CLONE3", "clone3 failed"),
        52 => LoaderOpen("ERR_EXEC_LOADER_OPEN", "opening loader binary failed"),
        53 => LoaderExec("ERR_EXEC_LOADER_EXEC", "executing loader failed"),
        54 => Recvmsg("ERR_EXEC_RECVMSG", "receiving control message failed"),
        55 => Sendmsg("ERR_EXEC_SENDMSG", "sending status record failed"),
        56 => ControlTruncated("ERR_EXEC_CMSG_TRUNC", "control message truncated"),
        57 => ControlFdCount("ERR_EXEC_CMSG_FDS", "wrong number of descriptors in control message"),
        58 => BadOp("ERR_EXEC_BAD_OP", "unknown request op"),
        59 => BadId("ERR_EXEC_BAD_ID", "request id out of range"),
        60 => DuplicateId("ERR_EXEC_DUP_ID", "create request for an id already in use"),
        61 => Waitpid("ERR_EXEC_WAITPID", "waitpid failed"),
        62 => Kill("ERR_EXEC_KILL", "signaling sandbox process failed"),
        63 => Signalfd("ERR_EXEC_SIGNALFD", "signalfd failed"),
        64 => Epoll("ERR_EXEC_EPOLL", "epoll failed"),
        65 => Pidfd("ERR_EXEC_PIDFD", "pidfd_open failed"),
        66 => Timerfd("ERR_EXEC_TIMERFD", "timerfd failed"),
        67 => ProcessCgroup("ERR_EXEC_CGROUP_ATTACH", "moving sandbox into process cgroup failed"),
        68 => Seccomp("ERR_EXEC_SECCOMP", "installing seccomp filter failed"),
        69 => Dup2("ERR_EXEC_DUP2", "dup2 failed"),
        70 => CloseRange("ERR_EXEC_CLOSE_RANGE", "close_range failed"),
        71 => ProcessLimit("ERR_EXEC_PROC_LIMIT", "too many sandbox processes"),
        72 => Shutdown("ERR_EXEC_SHUTDOWN", "control socket shutdown failed"),
        73 => Raise("ERR_EXEC_RAISE", "raising signal failed"),
        74 => Clock("ERR_EXEC_CLOCK", "reading clock failed"),
        75 => Alloc("ERR_EXEC_ALLOC", "memory allocation failed"),
    }
}

error_codes! {
    /// Exit codes of a sandboxed process which failed outside of WebAssembly
    /// execution (loader setup or runtime host calls).
    pub enum ProcessError {
        4 => Personality("ERR_LOAD_PERSONALITY", "setting execution domain failed"),
        5 => ReadInfo("ERR_LOAD_READ_INFO", "reading image info failed"),
        6 => Magic("ERR_LOAD_MAGIC", "image info magic mismatch"),
        7 => Recvmsg("ERR_LOAD_RECVMSG", "receiving image descriptors failed"),
        8 => ControlMessage("ERR_LOAD_CMSG", "unexpected image control message"),
        9 => NoCloexec("ERR_LOAD_NO_CLOEXEC", "descriptor flags are wrong"),
        10 => MmapVector("ERR_LOAD_MMAP_VECTOR", "mapping import vector failed"),
        11 => MprotectVector("ERR_LOAD_MPROTECT_VECTOR", "protecting import vector failed"),
        12 => MmapText("ERR_LOAD_MMAP_TEXT", "mapping text failed"),
        13 => MmapStack("ERR_LOAD_MMAP_STACK", "mapping stack failed"),
        14 => MmapHeap("ERR_LOAD_MMAP_HEAP", "mapping heap failed"),
        15 => MremapHeap("ERR_LOAD_MREMAP_HEAP", "remapping heap failed"),
        16 => CloseState("ERR_LOAD_CLOSE_STATE", "closing state descriptor failed"),
        17 => CloseText("ERR_LOAD_CLOSE_TEXT", "closing text descriptor failed"),
        18 => MunmapStack("ERR_LOAD_MUNMAP_STACK", "unmapping initial stack failed"),
        19 => MunmapLoader("ERR_LOAD_MUNMAP_LOADER", "unmapping loader failed"),
        20 => Sigaltstack("ERR_LOAD_SIGALTSTACK", "sigaltstack failed"),
        21 => SignalAction("ERR_LOAD_SIGACTION", "installing signal handler failed"),
        22 => SignalMask("ERR_LOAD_SIGMASK", "setting signal mask failed"),
        23 => Prctl("ERR_LOAD_PRCTL", "prctl failed"),
        24 => Seccomp("ERR_LOAD_SECCOMP", "installing seccomp filter failed"),
        25 => ArgEnv("ERR_LOAD_ARG_ENV", "unexpected arguments or environment"),
        26 => NoVdso("ERR_LOAD_NO_VDSO", "vdso not found"),
        27 => VdsoSymbol("ERR_LOAD_VDSO_SYMBOL", "vdso symbol not found"),
        28 => Timer("ERR_LOAD_TIMER", "creating timer failed"),
        29 => PageSize("ERR_LOAD_PAGE_SIZE", "page size mismatch"),
        30 => TextSize("ERR_LOAD_TEXT_SIZE", "text size is not page aligned"),
        31 => StackSize("ERR_LOAD_STACK_SIZE", "stack size is invalid"),
        32 => GlobalsSize("ERR_LOAD_GLOBALS_SIZE", "globals size is invalid"),
        40 => RuntimeRead("ERR_RT_READ", "reading from host failed"),
        41 => RuntimeWrite("ERR_RT_WRITE", "writing to host failed"),
        42 => RuntimeDebug("ERR_RT_DEBUG", "writing debug output failed"),
        43 => RuntimeClock("ERR_RT_CLOCK", "reading clock failed"),
        44 => RuntimeGrow("ERR_RT_MMAP", "growing memory failed"),
        45 => RuntimePoll("ERR_RT_POLL", "polling host descriptors failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_code_roundtrip() {
        let err = ContainerError::from_code(20);
        assert_eq!(err, ContainerError::UnshareUser);
        assert_eq!(err.code(), 20);
        assert_eq!(err.tag(), "ERR_CONT_UNSHARE_USER");
    }

    #[test]
    fn test_container_stderr_has_no_message() {
        let err = ContainerError::from_code(1);
        assert_eq!(err, ContainerError::Stderr);
        assert_eq!(err.message(), "");
        assert_eq!(err.to_string(), "ERR_CONT_STDERR (1)");
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let err = ContainerError::from_code(250);
        assert_eq!(err, ContainerError::Unknown(250));
        assert_eq!(err.code(), 250);
        assert!(err.to_string().contains("unknown error"));
    }

    #[test]
    fn test_process_error_display() {
        let err = ProcessError::from_code(6);
        assert_eq!(
            err.to_string(),
            "ERR_LOAD_MAGIC (6): image info magic mismatch"
        );
    }
}
