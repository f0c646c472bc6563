//! Open-file-descriptor limit raising.
//!
//! Terminating more than ~10^4 concurrent connections requires lifting the
//! soft RLIMIT_NOFILE up to the hard ceiling. This runs once at process
//! start; failure is reported to the caller, who decides whether to proceed
//! with the inherited limit.

use std::io;

/// Raise the soft open-file limit to the hard maximum.
///
/// Returns the resulting soft limit.
pub fn raise_nofile_limit() -> io::Result<u64> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: rlim is a valid, writable rlimit struct.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }

    rlim.rlim_cur = rlim.rlim_max;

    // SAFETY: rlim holds the limits just read back, with cur <= max.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(rlim.rlim_cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_nofile_limit() {
        // The soft limit afterwards must equal the hard limit.
        let cur = raise_nofile_limit().unwrap();

        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
        assert_eq!(rc, 0);
        assert_eq!(cur, rlim.rlim_max);
    }
}
