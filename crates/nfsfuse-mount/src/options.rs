//! Mount option translation.
//!
//! A `-o` option string is split into three outputs:
//!
//! - kernel mount flags ([`MountFlags`]), recorded in the mount table;
//! - bridge arguments, forwarded to the FUSE session as mount options;
//! - the residual "extra" options nothing here understands, kept verbatim
//!   for the NFS layer and the mount table.
//!
//! [`canonicalize`] runs the mapping the other way, producing the option
//! string written to the mount table.

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

bitflags! {
    /// Kernel mount flags, with the Linux `MS_*` values.
    ///
    /// `USER` and `USERS` are userspace-only bits from the mount(8)
    /// tradition and never reach the kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        const RDONLY = 1;
        const NOSUID = 2;
        const NODEV = 4;
        const NOEXEC = 8;
        const SYNCHRONOUS = 16;
        const REMOUNT = 32;
        const MANDLOCK = 64;
        const DIRSYNC = 128;
        const NOATIME = 1024;
        const NODIRATIME = 2048;
        const BIND = 4096;
        const REC = 16384;
        const SILENT = 32768;
        const USER = 0x2000_0000;
        const USERS = 0x4000_0000;
    }
}

/// Process-local switches that never enter the flag mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalFlags {
    /// Skip every mount table update.
    pub no_mtab: bool,
    /// Stay attached to the terminal.
    pub foreground: bool,
}

/// What a recognised option does beyond its flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Sets or clears the mask and forwards this bridge argument.
    Forward(&'static str),
    /// Sets the mask for the mount table branching (remount, bind) only.
    Structural,
    /// Accepted, logged as unsupported, otherwise ignored.
    Diagnostic,
}

/// One row of the option table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionEntry {
    pub name: &'static str,
    /// Never written back by [`canonicalize`].
    pub skip: bool,
    /// Presence clears `mask` instead of setting it.
    pub invert: bool,
    pub mask: MountFlags,
    pub kind: EntryKind,
}

const fn entry(
    name: &'static str,
    skip: bool,
    invert: bool,
    mask: MountFlags,
    kind: EntryKind,
) -> OptionEntry {
    OptionEntry {
        name,
        skip,
        invert,
        mask,
        kind,
    }
}

use EntryKind::{Diagnostic, Forward, Structural};

const NONE: MountFlags = MountFlags::empty();

/// The option table, in canonicalization order.
pub const OPTION_TABLE: &[OptionEntry] = &[
    entry("defaults", false, false, NONE, Diagnostic),
    entry("ro", true, false, MountFlags::RDONLY, Forward("ro")),
    entry("rw", true, true, MountFlags::RDONLY, Forward("rw")),
    entry("exec", false, true, MountFlags::NOEXEC, Diagnostic),
    entry("noexec", false, false, MountFlags::NOEXEC, Forward("noexec")),
    entry("suid", false, true, MountFlags::NOSUID, Forward("suid")),
    entry("nosuid", false, false, MountFlags::NOSUID, Forward("nosuid")),
    entry("dev", false, true, MountFlags::NODEV, Forward("dev")),
    entry("nodev", false, false, MountFlags::NODEV, Forward("nodev")),
    entry("sync", false, false, MountFlags::SYNCHRONOUS, Forward("sync")),
    entry("async", false, true, MountFlags::SYNCHRONOUS, Forward("async")),
    entry("dirsync", false, false, MountFlags::DIRSYNC, Forward("dirsync")),
    entry("remount", false, false, MountFlags::REMOUNT, Structural),
    entry("bind", false, false, MountFlags::BIND, Structural),
    entry(
        "rbind",
        false,
        false,
        MountFlags::BIND.union(MountFlags::REC),
        Structural,
    ),
    entry("auto", false, false, NONE, Diagnostic),
    entry("noauto", false, false, NONE, Diagnostic),
    entry("users", false, false, MountFlags::USERS, Forward("allow_other")),
    entry("nousers", false, true, MountFlags::USERS, Forward("allow_root")),
    entry("user", false, false, MountFlags::USER, Forward("allow_other")),
    entry("nouser", false, true, MountFlags::USER, Forward("allow_root")),
    entry("owner", false, false, NONE, Diagnostic),
    entry("noowner", false, false, NONE, Diagnostic),
    entry("group", false, false, NONE, Diagnostic),
    entry("nogroup", false, false, NONE, Diagnostic),
    entry("_netdev", false, false, NONE, Diagnostic),
    entry("comment", false, false, NONE, Diagnostic),
    entry("quiet", false, false, MountFlags::SILENT, Diagnostic),
    entry("loud", false, true, MountFlags::SILENT, Diagnostic),
    entry("mand", false, false, MountFlags::MANDLOCK, Diagnostic),
    entry("nomand", false, true, MountFlags::MANDLOCK, Diagnostic),
    entry("loop", true, false, NONE, Diagnostic),
    entry("atime", false, true, MountFlags::NOATIME, Forward("atime")),
    entry("noatime", false, false, MountFlags::NOATIME, Forward("noatime")),
    entry("diratime", false, true, MountFlags::NODIRATIME, Diagnostic),
    entry("nodiratime", false, false, MountFlags::NODIRATIME, Diagnostic),
];

/// Options the FUSE session understands natively; forwarded verbatim.
const INTRINSIC: &[&str] = &[
    "allow_other",
    "allow_root",
    "auto_unmount",
    "default_permissions",
    "kernel_cache",
];

/// Prefixes of intrinsic `key=value` options.
const INTRINSIC_KEYS: &[&str] = &["fsname=", "subtype=", "max_read="];

pub fn lookup(name: &str) -> Option<&'static OptionEntry> {
    OPTION_TABLE.iter().find(|e| e.name == name)
}

fn is_intrinsic(option: &str) -> bool {
    INTRINSIC.contains(&option) || INTRINSIC_KEYS.iter().any(|k| option.starts_with(k))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("unterminated quote in mount options starting at byte {position}")]
    UnterminatedQuote { position: usize },
}

/// Result of [`parse`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    pub flags: MountFlags,
    /// Unrecognised options, comma-joined, exactly as written.
    pub extra: String,
    pub bridge_args: Vec<String>,
    /// Recognised options that have no effect here.
    pub unsupported: Vec<String>,
}

impl ParsedOptions {
    pub fn is_remount(&self) -> bool {
        self.flags.contains(MountFlags::REMOUNT)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MountFlags::RDONLY)
    }

    /// Overrides whatever `ro`/`rw` the option string chose.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.flags.set(MountFlags::RDONLY, read_only);
        self.bridge_args.retain(|a| a != "ro" && a != "rw");
        self.bridge_args
            .push(if read_only { "ro" } else { "rw" }.to_string());
    }

    fn push_extra(&mut self, raw: &str) {
        if !self.extra.is_empty() {
            self.extra.push(',');
        }
        self.extra.push_str(raw);
    }

    fn apply(&mut self, raw: &str, value: &str) {
        if let Some(entry) = lookup(value) {
            match entry.kind {
                Forward(arg) => {
                    self.bridge_args.push(arg.to_string());
                    self.set(entry);
                }
                Structural => self.set(entry),
                Diagnostic => {
                    warn!(option = value, "mount option not supported, ignoring");
                    self.unsupported.push(value.to_string());
                }
            }
        } else if is_intrinsic(value) {
            debug!(option = value, "forwarding FUSE option");
            self.bridge_args.push(value.to_string());
        } else {
            self.push_extra(raw);
        }
    }

    fn set(&mut self, entry: &OptionEntry) {
        if entry.invert {
            self.flags.remove(entry.mask);
        } else {
            self.flags.insert(entry.mask);
        }
    }
}

/// One comma-separated item: the text as written and the unquoted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub raw: &'a str,
    pub value: String,
}

/// Splits on commas outside double quotes. Empty items are dropped.
pub(crate) fn tokenize(options: &str) -> Result<Vec<Token<'_>>, OptionError> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut quote_at = None;
    for (i, c) in options.char_indices() {
        match c {
            '"' => quote_at = if quote_at.is_some() { None } else { Some(i) },
            ',' if quote_at.is_none() => {
                push_token(&mut tokens, &options[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if let Some(position) = quote_at {
        return Err(OptionError::UnterminatedQuote { position });
    }
    push_token(&mut tokens, &options[start..]);
    Ok(tokens)
}

fn push_token<'a>(tokens: &mut Vec<Token<'a>>, raw: &'a str) {
    if !raw.is_empty() {
        tokens.push(Token {
            raw,
            value: raw.replace('"', ""),
        });
    }
}

/// Parses a mount option string.
///
/// An empty string yields a read-write mount with nothing forwarded.
pub fn parse(options: &str) -> Result<ParsedOptions, OptionError> {
    let mut parsed = ParsedOptions::default();
    for token in tokenize(options)? {
        parsed.apply(token.raw, &token.value);
    }
    debug!(
        flags = ?parsed.flags,
        bridge_args = ?parsed.bridge_args,
        extra = %parsed.extra,
        "parsed mount options"
    );
    Ok(parsed)
}

/// Builds the mount table option string for `flags`.
///
/// With `USER` set, `user=<name>` follows `ro`/`rw` when the current user's
/// name can be looked up.
pub fn canonicalize(flags: MountFlags, extra: &str) -> String {
    let user = if flags.contains(MountFlags::USER) {
        current_user_name()
    } else {
        None
    };
    canonicalize_with(flags, extra, user.as_deref())
}

/// [`canonicalize`] with the user name supplied by the caller.
pub fn canonicalize_with(flags: MountFlags, extra: &str, user: Option<&str>) -> String {
    let mut out = String::from(if flags.contains(MountFlags::RDONLY) {
        "ro"
    } else {
        "rw"
    });
    if flags.contains(MountFlags::USER)
        && let Some(name) = user
    {
        out.push_str(",user=");
        out.push_str(name);
    }

    let mut remaining = flags;
    for entry in OPTION_TABLE {
        if entry.skip || entry.invert || entry.mask.is_empty() {
            continue;
        }
        if remaining.contains(entry.mask) {
            out.push(',');
            out.push_str(entry.name);
            remaining.remove(entry.mask);
        }
    }

    if !extra.is_empty() {
        out.push(',');
        out.push_str(extra);
    }
    out
}

fn current_user_name() -> Option<String> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(e) => {
            debug!(error = %e, "user lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(options: &str) -> Vec<String> {
        tokenize(options)
            .unwrap()
            .into_iter()
            .map(|t| t.value)
            .collect()
    }

    #[test]
    fn test_table_names_are_unique() {
        for (i, a) in OPTION_TABLE.iter().enumerate() {
            for b in &OPTION_TABLE[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_quoted_commas_stay_in_token() {
        assert_eq!(values(r#"a,"b,c",d"#), vec!["a", "b,c", "d"]);
    }

    #[test]
    fn test_empty_items_are_dropped() {
        assert_eq!(values(",a,,b,"), vec!["a", "b"]);
        assert!(values("").is_empty());
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(
            parse(r#"ro,"abc"#).unwrap_err(),
            OptionError::UnterminatedQuote { position: 3 }
        );
    }

    #[test]
    fn test_empty_string_is_read_write() {
        let parsed = parse("").unwrap();
        assert_eq!(parsed.flags, MountFlags::empty());
        assert!(parsed.extra.is_empty());
        assert!(parsed.bridge_args.is_empty());
        assert!(!parsed.is_read_only());
    }

    #[test]
    fn test_rw_clears_and_ro_sets() {
        assert!(parse("ro").unwrap().is_read_only());
        assert!(!parse("ro,rw").unwrap().is_read_only());
        assert!(parse("rw,ro").unwrap().is_read_only());
    }

    #[test]
    fn test_mixed_option_string() {
        let parsed = parse("ro,exec,noatime,foo=bar").unwrap();
        assert_eq!(parsed.flags, MountFlags::RDONLY | MountFlags::NOATIME);
        assert_eq!(parsed.bridge_args, vec!["ro", "noatime"]);
        assert_eq!(parsed.unsupported, vec!["exec"]);
        assert_eq!(parsed.extra, "foo=bar");
    }

    #[test]
    fn test_unknown_options_are_kept_verbatim() {
        let parsed = parse(r#"vers=4,"sec=krb5,krb5i",actimeo=3"#).unwrap();
        assert_eq!(parsed.extra, r#"vers=4,"sec=krb5,krb5i",actimeo=3"#);
        assert!(parsed.bridge_args.is_empty());
    }

    #[test]
    fn test_long_extra_is_not_truncated() {
        let long: Vec<String> = (0..200).map(|i| format!("opt{i}=value{i}")).collect();
        let joined = long.join(",");
        assert_eq!(parse(&joined).unwrap().extra, joined);
    }

    #[test]
    fn test_intrinsic_options_are_forwarded() {
        let parsed = parse("allow_other,fsname=srv:/x,default_permissions").unwrap();
        assert_eq!(
            parsed.bridge_args,
            vec!["allow_other", "fsname=srv:/x", "default_permissions"]
        );
        assert!(parsed.extra.is_empty());
        assert!(parsed.flags.is_empty());
    }

    #[test]
    fn test_structural_options_set_flags_without_arguments() {
        let parsed = parse("remount,rbind").unwrap();
        assert!(parsed.is_remount());
        assert!(parsed.flags.contains(MountFlags::BIND | MountFlags::REC));
        assert!(parsed.bridge_args.is_empty());
    }

    #[test]
    fn test_user_maps_to_allow_other() {
        let parsed = parse("user").unwrap();
        assert_eq!(parsed.flags, MountFlags::USER);
        assert_eq!(parsed.bridge_args, vec!["allow_other"]);
        let parsed = parse("user,nouser").unwrap();
        assert!(parsed.flags.is_empty());
    }

    #[test]
    fn test_canonicalize_order() {
        let flags = MountFlags::RDONLY | MountFlags::NOSUID | MountFlags::NOEXEC;
        assert_eq!(canonicalize_with(flags, "", None), "ro,noexec,nosuid");
        assert_eq!(
            canonicalize_with(MountFlags::empty(), "vers=3", None),
            "rw,vers=3"
        );
    }

    #[test]
    fn test_canonicalize_user_name() {
        assert_eq!(
            canonicalize_with(MountFlags::USER, "", Some("alice")),
            "rw,user=alice,user"
        );
        // Lookup failure omits the name silently.
        assert_eq!(canonicalize_with(MountFlags::USER, "", None), "rw,user");
    }

    #[test]
    fn test_canonicalize_consumes_bits() {
        // rbind needs BIND, which bind already consumed.
        let flags = MountFlags::BIND | MountFlags::REC;
        assert_eq!(canonicalize_with(flags, "", None), "rw,bind");
    }

    #[test]
    fn test_command_line_read_only_overrides_options() {
        let mut parsed = parse("rw,nosuid").unwrap();
        parsed.set_read_only(true);
        assert!(parsed.is_read_only());
        assert_eq!(parsed.bridge_args, vec!["nosuid", "ro"]);

        parsed.set_read_only(false);
        assert!(!parsed.is_read_only());
        assert_eq!(parsed.bridge_args, vec!["nosuid", "rw"]);
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    /// Flags a canonical string can carry through forwarding entries.
    fn forwardable() -> MountFlags {
        OPTION_TABLE
            .iter()
            .filter(|e| !e.skip && !e.invert && matches!(e.kind, EntryKind::Forward(_)))
            .fold(MountFlags::RDONLY, |acc, e| acc | e.mask)
    }

    proptest! {
        /// Canonical strings re-parse to the flags they came from.
        #[test]
        fn canonical_string_round_trips(bits in any::<u32>()) {
            let flags = MountFlags::from_bits_truncate(bits) & forwardable();
            let canonical = canonicalize_with(flags, "", None);
            let parsed = parse(&canonical).unwrap();
            prop_assert_eq!(parsed.flags, flags);
            prop_assert!(parsed.extra.is_empty());
        }

        /// Unknown options survive untouched behind the canonical prefix.
        #[test]
        fn extra_options_survive(
            keys in prop::collection::vec("x[a-z]{2,7}=[0-9]{1,4}", 0..6)
        ) {
            let extra = keys.join(",");
            let parsed = parse(&canonicalize_with(MountFlags::empty(), &extra, None)).unwrap();
            prop_assert_eq!(parsed.extra, extra);
        }
    }
}
