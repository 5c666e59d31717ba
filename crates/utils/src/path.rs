use std::ffi::OsStr;
use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;

/// Display an argument or path the way a POSIX shell would need it written.
///
/// Plain UTF-8 made only of alphanumerics and a few safe punctuation
/// characters is emitted unchanged; everything else goes through [`shlex`].
#[derive(Debug, Clone, Copy)]
pub struct ShellQuoted<'a>(&'a OsStr);

impl<'a> ShellQuoted<'a> {
    /// Wrap anything that can be viewed as an `OsStr`, which covers
    /// `str`, `Path`, `OsString` and `camino::Utf8Path`.
    pub fn new<S: AsRef<OsStr> + ?Sized>(s: &'a S) -> Self {
        Self(s.as_ref())
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | '+' | ',' | ':' | '=' | '@')
}

impl Display for ShellQuoted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.0.to_str() {
            if !s.is_empty() && s.chars().all(is_shell_safe) {
                return f.write_str(s);
            }
        }
        match shlex::bytes::try_quote(self.0.as_bytes()) {
            Ok(r) => f.write_str(&String::from_utf8_lossy(&r)),
            // Only happens for embedded NUL, which can't be a valid argument anyway
            Err(_) => Err(std::fmt::Error),
        }
    }
}
