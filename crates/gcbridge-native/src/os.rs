//! Process memory queries.

/// Peak resident set size of this process in bytes, or 0 when the platform
/// does not report it.
#[must_use]
pub fn peak_rss_bytes() -> usize {
    #[cfg(unix)]
    {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: `usage` is valid for writes of one `rusage`.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return 0;
        }
        // SAFETY: getrusage succeeded and filled the struct.
        let max_rss = unsafe { usage.assume_init() }.ru_maxrss;
        let max_rss = usize::try_from(max_rss).unwrap_or(0);
        // Linux and the BSDs report KiB; Apple targets report bytes.
        if cfg!(target_vendor = "apple") {
            max_rss
        } else {
            max_rss.saturating_mul(1024)
        }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn running_process_has_resident_memory() {
        let _touch = vec![1u8; 1 << 20];
        assert!(peak_rss_bytes() > 0);
    }

    #[test]
    fn peak_never_decreases() {
        let first = peak_rss_bytes();
        let second = peak_rss_bytes();
        assert!(second >= first);
    }
}
