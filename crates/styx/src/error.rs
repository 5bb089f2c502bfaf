//! Error representation for 9P servers and clients.
//!
//! A 9P error travels as an `Rerror` message: a human-readable string plus,
//! under 9P2000.u, a numeric errno. `Error` carries both sides.

use std::{fmt, io};

/// POSIX errno values used on the wire by 9P2000.u.
pub mod errno {
    pub const EPERM: u32 = 1;
    pub const ENOENT: u32 = 2;
    pub const EIO: u32 = 5;
    pub const EBADF: u32 = 9;
    pub const EBUSY: u32 = 16;
    pub const EEXIST: u32 = 17;
    pub const ENOTDIR: u32 = 20;
    pub const EINVAL: u32 = 22;
    pub const EPROTO: u32 = 71;
    pub const EOPNOTSUPP: u32 = 95;
}

/// Canonical description for an errno carried without an explicit message.
pub fn string(errno: u32) -> &'static str {
    match errno {
        self::errno::EPERM => "permission denied",
        self::errno::ENOENT => "file not found",
        self::errno::EIO => "i/o error",
        self::errno::EBADF => "bad file descriptor",
        self::errno::EBUSY => "device or resource busy",
        self::errno::EEXIST => "file already exists",
        self::errno::ENOTDIR => "not a directory",
        self::errno::EINVAL => "invalid argument",
        self::errno::EPROTO => "protocol error",
        self::errno::EOPNOTSUPP => "operation not supported",
        _ => "unknown error",
    }
}

/// The error type for 9P operations.
#[derive(Debug)]
pub enum Error {
    /// An errno with its canonical description as the ename.
    No(u32),
    /// An explicit ename paired with an errno.
    Msg(String, u32),
    /// An I/O failure below the protocol layer.
    Io(io::Error),
}

impl Error {
    pub fn new<T: Into<String>>(ename: T, errno: u32) -> Error {
        Error::Msg(ename.into(), errno)
    }

    /// "file already exists"
    pub fn eexist() -> Error {
        Error::new("file already exists", errno::EEXIST)
    }

    /// "file not found"
    pub fn enoent() -> Error {
        Error::new("file not found", errno::ENOENT)
    }

    /// "directory not empty"
    ///
    /// Carries EPERM on the wire, as the Plan 9 servers do.
    pub fn enotempty() -> Error {
        Error::new("directory not empty", errno::EPERM)
    }

    /// "permission denied"
    pub fn eperm() -> Error {
        Error::new("permission denied", errno::EPERM)
    }

    /// The errno reported under 9P2000.u.
    pub fn errno(&self) -> u32 {
        match *self {
            Error::No(n) => n,
            Error::Msg(_, n) => n,
            Error::Io(_) => errno::EIO,
        }
    }

    /// The ename reported in an `Rerror`.
    pub fn ename(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::No(n) => f.write_str(string(n)),
            Error::Msg(ref m, _) => f.write_str(m),
            Error::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors() {
        assert_eq!(Error::eexist().ename(), "file already exists");
        assert_eq!(Error::eexist().errno(), errno::EEXIST);
        assert_eq!(Error::enoent().errno(), errno::ENOENT);
        assert_eq!(Error::eperm().ename(), "permission denied");

        // Enotempty reports EPERM, not a dedicated errno.
        let e = Error::enotempty();
        assert_eq!(e.ename(), "directory not empty");
        assert_eq!(e.errno(), errno::EPERM);
    }

    #[test]
    fn io_errors_map_to_eio() {
        let e: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(e.errno(), errno::EIO);
        assert_eq!(e.ename(), "boom");
    }
}
