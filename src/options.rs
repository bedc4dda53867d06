//! Decoder configuration.

/// Maximum accepted password length in bytes; longer passwords are
/// clamped at a UTF-8 character boundary.
const MAX_PASSWORD: usize = 128;

/// Default number of leading bytes searched for the archive signature,
/// covering self-extracting stubs.
pub(crate) const DEFAULT_SFX_WINDOW: u64 = 1 << 20;

/// Options for opening and decoding an archive.
///
/// ```
/// use rarfs::Options;
///
/// let opts = Options::new().password("secret").skip_check(true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub(crate) password: Option<String>,
    pub(crate) skip_check: bool,
    pub(crate) open_check: bool,
    pub(crate) max_concurrent_volumes: usize,
}

impl Options {
    pub fn new() -> Self {
        Options::default()
    }

    /// Password for encrypted headers and file data.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        let mut pw: String = password.into();
        if pw.len() > MAX_PASSWORD {
            let mut end = MAX_PASSWORD;
            while !pw.is_char_boundary(end) {
                end -= 1;
            }
            pw.truncate(end);
        }
        self.password = Some(pw);
        self
    }

    /// Suppress checksum verification on decoded file contents.
    pub fn skip_check(mut self, skip: bool) -> Self {
        self.skip_check = skip;
        self
    }

    /// Eagerly verify every file hash while listing.
    ///
    /// Implies checksum verification even if [`Options::skip_check`]
    /// was set.
    pub fn open_check(mut self, check: bool) -> Self {
        self.open_check = check;
        self
    }

    /// Concurrency hint for the parallel volume pre-scan. Best-effort;
    /// values below 2 select the sequential path.
    pub fn max_concurrent_volumes(mut self, n: usize) -> Self {
        self.max_concurrent_volumes = n;
        self
    }

    pub(crate) fn password_bytes(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_clamped_to_limit() {
        let long = "x".repeat(300);
        let opts = Options::new().password(long);
        assert_eq!(opts.password.unwrap().len(), MAX_PASSWORD);
    }

    #[test]
    fn test_password_clamp_respects_char_boundary() {
        // 2-byte chars; 128 is not a boundary of "é" repeated 65 times
        let pw = "é".repeat(65); // 130 bytes
        let opts = Options::new().password(pw);
        let clamped = opts.password.unwrap();
        assert!(clamped.len() <= MAX_PASSWORD);
        assert!(clamped.is_char_boundary(clamped.len()));
    }

    #[test]
    fn test_defaults() {
        let opts = Options::new();
        assert!(opts.password.is_none());
        assert!(!opts.skip_check);
        assert!(!opts.open_check);
    }
}
