// Kernel error handling and errno definitions

/// Internal kernel error taxonomy.
///
/// Subsystems report recoverable failures with these; the syscall boundary
/// converts them to negative errno values. Programmer errors (lock-order
/// violations, double frees, scheduling invariant breaks) never travel
/// through this type; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    OutOfPids,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    WouldBlock,
    Interrupted,
    Busy,
    TimedOut,
    NotSupported,
    BadAddress,
    NotInitialized,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such file or directory
    ESRCH = 3,       // No such process
    EINTR = 4,       // Interrupted system call
    EIO = 5,         // I/O error
    EBADF = 9,       // Bad file descriptor
    ECHILD = 10,     // No child processes
    EAGAIN = 11,     // Try again / would block
    ENOMEM = 12,     // Out of memory
    EACCES = 13,     // Permission denied
    EFAULT = 14,     // Bad address
    EBUSY = 16,      // Device or resource busy
    EEXIST = 17,     // File exists
    EINVAL = 22,     // Invalid argument
    EMFILE = 24,     // Too many open files
    ERANGE = 34,     // Math result not representable
    ENOSYS = 38,     // Function not implemented
    ETIMEDOUT = 110, // Timed out
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::OutOfPids => Errno::EAGAIN,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::PermissionDenied => Errno::EPERM,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::Busy => Errno::EBUSY,
            KernelError::TimedOut => Errno::ETIMEDOUT,
            KernelError::NotSupported => Errno::ENOSYS,
            KernelError::BadAddress => Errno::EFAULT,
            KernelError::NotInitialized => Errno::EINVAL,
        }
    }
}

impl Errno {
    /// Negated value for the syscall return convention.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted system call",
            Errno::EIO => "I/O error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EBUSY => "Device or resource busy",
            Errno::EEXIST => "File exists",
            Errno::EINVAL => "Invalid argument",
            Errno::EMFILE => "Too many open files",
            Errno::ERANGE => "Math result not representable",
            Errno::ENOSYS => "Function not implemented",
            Errno::ETIMEDOUT => "Timed out",
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_maps_to_errno() {
        assert_eq!(Errno::from(KernelError::OutOfMemory), Errno::ENOMEM);
        assert_eq!(Errno::from(KernelError::OutOfPids), Errno::EAGAIN);
        assert_eq!(Errno::from(KernelError::Interrupted), Errno::EINTR);
    }

    #[test]
    fn errno_negated_for_syscalls() {
        assert_eq!(Errno::EINVAL.as_isize(), -22);
        assert_eq!(Errno::ENOMEM.as_isize(), -12);
    }
}
