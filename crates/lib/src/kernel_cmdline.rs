//! Kernel command line parsing utilities.
//!
//! [`Cmdline`] tokenizes raw command line bytes, supporting both key-only
//! switches and key-value pairs with proper quote handling. [`BootOptions`]
//! is the owned, ordered list of tokens that ends up embedded in a boot
//! entry or unified kernel image.

use std::borrow::Cow;
use std::fmt::Display;

/// Boot loader injected argument naming the initrd; never valid to persist.
const INITRD_PREFIX: &str = "initrd=";
/// GRUB injected argument naming the kernel image; never valid to persist.
const BOOT_IMAGE_PREFIX: &str = "BOOT_IMAGE=";
/// A root device referenced by GPT partition UUID.
const ROOT_PARTUUID_PREFIX: &str = "root=PARTUUID=";

/// A parsed kernel command line.
///
/// Wraps the raw command line bytes. Uses copy-on-write semantics to avoid
/// unnecessary allocations when working with borrowed data.
pub(crate) struct Cmdline<'a>(Cow<'a, [u8]>);

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

impl<'a> Cmdline<'a> {
    /// Returns an iterator over all parameters in the command line.
    ///
    /// Splits on unquoted whitespace; runs of whitespace and a trailing
    /// newline do not produce empty parameters.
    pub fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> + 'a {
        let mut in_quotes = false;

        self.0
            .split(move |c| {
                if *c == b'"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|p| !p.is_empty())
            .map(Parameter::from)
    }

    /// Locate a kernel argument with the given key name.
    ///
    /// Key comparison treats dashes and underscores as equivalent.
    pub fn find(&'a self, key: impl AsRef<[u8]>) -> Option<Parameter<'a>> {
        let key = key.as_ref();
        self.iter().find(|p| key_eq(p.key, key))
    }

    /// Locate the UTF-8 value of the kernel argument with the given key name.
    pub fn value_of_utf8(&'a self, key: &str) -> Option<&'a str> {
        self.find(key)
            .and_then(|p| p.value)
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

fn key_eq(a: &[u8], b: &[u8]) -> bool {
    let dedashed = |&c: &u8| if c == b'-' { b'_' } else { c };
    // Not zip(): "foo" would compare equal to "foobar"
    a.iter().map(dedashed).eq(b.iter().map(dedashed))
}

/// A single kernel command line parameter.
#[derive(Debug, Eq)]
pub(crate) struct Parameter<'a> {
    /// The full original text
    pub parameter: &'a [u8],
    /// The parameter key as raw bytes
    pub key: &'a [u8],
    /// The parameter value as raw bytes, if present
    pub value: Option<&'a [u8]>,
}

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Parameter<'a> {
    /// Splits on the first `=`, and strips only the outermost pair of
    /// double quotes from the value.
    fn from(input: &'a T) -> Self {
        let input = input.as_ref();
        match input.iter().position(|b| *b == b'=') {
            None => Self {
                parameter: input,
                key: input,
                value: None,
            },
            Some(i) => {
                let (key, value) = input.split_at(i);
                let value = &value[1..];
                let value = value
                    .strip_prefix(b"\"")
                    .unwrap_or(value)
                    .strip_suffix(b"\"")
                    .unwrap_or(value);
                Self {
                    parameter: input,
                    key,
                    value: Some(value),
                }
            }
        }
    }
}

impl PartialEq for Parameter<'_> {
    fn eq(&self, other: &Self) -> bool {
        key_eq(self.key, other.key) && self.value == other.value
    }
}

/// The kernel command line options for a boot entry, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub(crate) struct BootOptions(Vec<String>);

impl BootOptions {
    /// Parse options from a configuration file such as `/etc/kernel/cmdline`.
    ///
    /// Non UTF-8 tokens are dropped with a warning, as they cannot be
    /// passed through to the image builder.
    pub(crate) fn parse(text: &str) -> Self {
        let cmdline = Cmdline::from(text);
        let tokens = cmdline
            .iter()
            .filter_map(|p| match std::str::from_utf8(p.parameter) {
                Ok(s) => Some(s.to_owned()),
                Err(_) => {
                    tracing::warn!(
                        "Ignoring non UTF-8 kernel argument: {}",
                        String::from_utf8_lossy(p.parameter)
                    );
                    None
                }
            })
            .collect();
        Self(tokens)
    }

    /// Parse the command line of the running kernel, dropping the
    /// arguments that the boot loader injects for the current boot only.
    pub(crate) fn from_running(proc_cmdline: &str) -> Self {
        let Self(tokens) = Self::parse(proc_cmdline);
        Self(
            tokens
                .into_iter()
                .filter(|t| !t.starts_with(INITRD_PREFIX) && !t.starts_with(BOOT_IMAGE_PREFIX))
                .collect(),
        )
    }

    /// Whether the root device is named by partition UUID, in which
    /// case the builder may skip generating a host-specific image.
    pub(crate) fn root_is_partuuid(&self) -> bool {
        self.iter().any(|t| t.starts_with(ROOT_PARTUUID_PREFIX))
    }

    /// The value of `root=`, if any.
    pub(crate) fn root(&self) -> Option<String> {
        let joined = self.join();
        let cmdline = Cmdline::from(joined.as_str());
        cmdline.value_of_utf8("root").map(ToOwned::to_owned)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All options separated by a single space.
    pub(crate) fn join(&self) -> String {
        self.0.join(" ")
    }
}

impl Display for BootOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.join())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_simple() {
        let switch = Parameter::from("rhgb");
        assert_eq!(switch.key, b"rhgb");
        assert_eq!(switch.value, None);

        let kv = Parameter::from("root=UUID=abcd");
        assert_eq!(kv.key, b"root");
        assert_eq!(kv.value, Some(b"UUID=abcd".as_slice()));
    }

    #[test]
    fn test_parameter_quoted() {
        let p = Parameter::from("foo=\"quoted value\"");
        assert_eq!(p.value, Some(b"quoted value".as_slice()));

        // quotes only get stripped from the absolute ends of values
        let p = Parameter::from("foo=\"internal \" quotes \" are ok\"");
        assert_eq!(p.value, Some(b"internal \" quotes \" are ok".as_slice()));
    }

    #[test]
    fn test_parameter_equality() {
        assert_ne!(Parameter::from("foo"), Parameter::from("foobar"));
        assert_eq!(
            Parameter::from("rd.lvm-lv=a"),
            Parameter::from("rd.lvm_lv=a")
        );
        assert_ne!(Parameter::from("quiet"), Parameter::from("quiet=1"));
    }

    #[test]
    fn test_cmdline_whitespace() {
        let kargs = Cmdline::from(b"  foo=bar   baz=\"a b\"\twiz\n".as_slice());
        let params: Vec<_> = kargs.iter().map(|p| p.parameter).collect();
        assert_eq!(
            params,
            [
                b"foo=bar".as_slice(),
                b"baz=\"a b\"".as_slice(),
                b"wiz".as_slice()
            ]
        );
        assert_eq!(kargs.value_of_utf8("baz"), Some("a b"));
        assert!(kargs.find("nothing").is_none());
    }

    #[test]
    fn test_boot_options_parse() {
        let opts = BootOptions::parse("root=UUID=abc ro\n rhgb quiet\n");
        assert_eq!(
            opts.iter().collect::<Vec<_>>(),
            ["root=UUID=abc", "ro", "rhgb", "quiet"]
        );
        assert_eq!(opts.join(), "root=UUID=abc ro rhgb quiet");
        assert_eq!(opts.root().as_deref(), Some("UUID=abc"));
        assert!(BootOptions::parse("\n").is_empty());
    }

    #[test]
    fn test_boot_options_from_running() {
        let opts = BootOptions::from_running(
            "BOOT_IMAGE=(hd0,gpt2)/vmlinuz-6.9.1-200.fc40.x86_64 root=UUID=abc ro initrd=\\initramfs.img rhgb myinitrd=1\n",
        );
        assert_eq!(opts.join(), "root=UUID=abc ro rhgb myinitrd=1");
        assert!(opts.iter().all(|t| !t.starts_with("initrd=")));
        assert!(opts.iter().all(|t| !t.starts_with("BOOT_IMAGE=")));
    }

    #[test]
    fn test_root_is_partuuid() {
        assert!(BootOptions::parse("ro root=PARTUUID=0fc63daf-8483 quiet").root_is_partuuid());
        assert!(!BootOptions::parse("root=UUID=0fc63daf ro").root_is_partuuid());
        assert!(!BootOptions::parse("myroot=PARTUUID=0fc63daf").root_is_partuuid());
        assert!(!BootOptions::parse("root=partuuid=0fc63daf").root_is_partuuid());
        assert!(!BootOptions::default().root_is_partuuid());
    }
}
