//! The control channel.
//!
//! A write to the control node is interpreted as line-oriented commands
//! driving handler and device lifecycle; reading the node back yields the
//! current tree dump. Replies and errors are printed to stderr as
//! interactive responses, and the write always reports its full length so
//! the writing process (`echo`, `cat`) does not retry.
//!
//! Grammar: `#` starts a comment, blank lines are ignored, and a command
//! keyword matches on any non-empty initial substring, ignoring case —
//! `lo ram` is `load ram`.

use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use blockgate_types::{Error, MAX_MINORS, Result};
use futures::future::BoxFuture;

use crate::gateway::Gateway;
use crate::tree::NodeOps;

/// Cap on the size of a file pulled in by `source`. Larger scripts can
/// nest further `source` commands.
const MAX_SOURCE: u64 = 4096;

/// Ops of the control node.
pub struct CtlOps {
    gateway: Weak<Gateway>,
}

impl CtlOps {
    pub(crate) fn new(gateway: &Arc<Gateway>) -> Arc<CtlOps> {
        Arc::new(CtlOps {
            gateway: Arc::downgrade(gateway),
        })
    }

    /// Run a buffer of commands and return the interactive replies.
    pub async fn run_script(&self, input: &str) -> String {
        let mut out = String::new();
        self.run(input, &mut out).await;
        out
    }

    /// Interpret a buffer of commands, appending replies to `out`.
    /// Boxed because `source` re-enters the interpreter.
    fn run<'a>(&'a self, input: &'a str, out: &'a mut String) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(gateway) = self.gateway.upgrade() else {
                out.push_str("gateway is shutting down\n");
                return;
            };

            for raw in input.lines() {
                let line = clean_line(raw);
                if line.is_empty() {
                    continue;
                }
                // Echo the command line.
                let _ = writeln!(out, "> {line}");

                let (cmd, args) = split_field(line);

                if str_match(cmd, "help") {
                    out.push_str(HELP);
                } else if str_match(cmd, "add") {
                    self.cmd_add(&gateway, args, out).await;
                } else if str_match(cmd, "remove") {
                    self.cmd_remove(&gateway, args, out).await;
                } else if str_match(cmd, "load") {
                    self.cmd_load(&gateway, args, out);
                } else if str_match(cmd, "unload") {
                    self.cmd_unload(&gateway, args, out);
                } else if str_match(cmd, "source") {
                    self.cmd_source(args, out).await;
                } else if str_match(cmd, "exit") {
                    // Delayed so the reply to this write is delivered
                    // before the event loop stops.
                    gateway.schedule_exit();
                } else if str_match(cmd, "echo") {
                    // Line already echoed.
                } else if str_match(cmd, "dump") {
                    out.push_str(&gateway.fmt_tree());
                } else {
                    let _ = writeln!(out, "  ? {line}\nTry 'help'");
                }
            }
        })
    }

    async fn cmd_add(&self, gateway: &Gateway, args: &str, out: &mut String) {
        let (num, cfg) = split_field(args);
        let Some(minor) = parse_number(num) else {
            let _ = writeln!(out, "Bad number: {num}");
            return;
        };
        if minor > MAX_MINORS as u64 {
            let _ = writeln!(out, "Number too big: {minor} > {}=max", MAX_MINORS - 1);
            return;
        }
        if !cfg.starts_with('/') {
            out.push_str("Usage: add minor_number /subtype/handler_cfgstring\n");
            return;
        }
        if let Err(err) = gateway.add_device(minor as usize, cfg).await {
            let _ = writeln!(out, "device_add({minor}, \"{cfg}\") returns {err}");
        }
    }

    async fn cmd_remove(&self, gateway: &Gateway, args: &str, out: &mut String) {
        let (num, _) = split_field(args);
        let Some(minor) = parse_number(num) else {
            let _ = writeln!(out, "Bad number: {num}");
            return;
        };
        if minor > MAX_MINORS as u64 {
            let _ = writeln!(out, "Number too big: {minor} > {}=max", MAX_MINORS - 1);
            return;
        }
        if let Err(err) = gateway.remove_device(minor as usize).await {
            let _ = writeln!(out, "remove {minor}: {err}");
        }
    }

    fn cmd_load(&self, gateway: &Gateway, args: &str, out: &mut String) {
        let (subtype, _) = split_field(args);
        if !starts_alnum(subtype) {
            out.push_str("Usage: load handler_subtype\n");
            return;
        }
        if let Err(err) = gateway.load_handler(subtype) {
            let _ = writeln!(out, "{subtype}: {err}");
        }
    }

    fn cmd_unload(&self, gateway: &Gateway, args: &str, out: &mut String) {
        let (subtype, _) = split_field(args);
        if !starts_alnum(subtype) {
            out.push_str("Usage: unload handler_subtype\n");
            return;
        }
        if let Err(err) = gateway.unload_handler(subtype) {
            let _ = writeln!(out, "{subtype}: {err}");
        }
    }

    async fn cmd_source(&self, args: &str, out: &mut String) {
        let (path, _) = split_field(args);
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                let _ = writeln!(out, "{err}: {path}");
                if !path.starts_with('/') {
                    out.push_str("(Note relative pathnames are relative to the server's CWD)\n");
                }
                return;
            }
        };
        if meta.len() > MAX_SOURCE {
            let _ = writeln!(
                out,
                "{path} too large {} (but you can nest them with 'source')",
                meta.len()
            );
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => self.run(&content, out).await,
            Err(err) => {
                let _ = writeln!(out, "{err}: {path}");
            }
        }
    }
}

const HELP: &str = "\
Commands:
   add    minor_number /subtype/handler_cfgstring
   remove minor_number
   load   handler_subtype
   unload handler_subtype
   source filename         # read commands from filename
   dump                    # print a representation of the tree
";

#[async_trait]
impl NodeOps for CtlOps {
    /// Reading the control node yields the tree dump from the read offset.
    async fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let Some(gateway) = self.gateway.upgrade() else {
            return Err(Error::BadFile("gateway is gone".into()));
        };
        let dump = gateway.fmt_tree().into_bytes();
        let start = (offset as usize).min(dump.len());
        let end = (start + size).min(dump.len());
        Ok(dump[start..end].to_vec())
    }

    async fn write(&self, data: &[u8], _offset: u64) -> Result<usize> {
        let text = String::from_utf8_lossy(data);
        let mut out = String::new();
        self.run(&text, &mut out).await;
        if !out.is_empty() {
            eprint!("{out}");
        }
        // The writer always sees the whole write consumed.
        Ok(data.len())
    }
}

/// Strip a trailing comment and surrounding blanks.
fn clean_line(line: &str) -> &str {
    let line = match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    };
    line.trim()
}

/// Split off the first whitespace-separated field.
fn split_field(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim_start()),
        None => (s, ""),
    }
}

/// True when the word's alphanumeric prefix is a non-empty initial
/// substring of `pattern` (lower case), ignoring case.
fn str_match(word: &str, pattern: &str) -> bool {
    let prefix_len = word
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .count();
    if prefix_len == 0 || prefix_len > pattern.len() {
        return false;
    }
    word.chars()
        .take(prefix_len)
        .zip(pattern.chars())
        .all(|(a, b)| a.to_ascii_lowercase() == b)
}

fn starts_alnum(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Parse a decimal or 0x-prefixed number.
fn parse_number(field: &str) -> Option<u64> {
    if let Some(hex) = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        field.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::gateway::{Gateway, GatewayConfig};
    use crate::loader::BuiltinLoader;

    fn gateway() -> Arc<Gateway> {
        Gateway::new(GatewayConfig::default(), Box::new(BuiltinLoader::new())).unwrap()
    }

    #[rstest::rstest]
    #[case("load", true)]
    #[case("lo", true)]
    #[case("L", true)]
    #[case("LOAD", true)]
    #[case("loadx", false)]
    #[case("x", false)]
    #[case("", false)]
    #[case("#", false)]
    fn keyword_matching_is_initial_substring_case_insensitive(
        #[case] word: &str,
        #[case] matches: bool,
    ) {
        assert_eq!(str_match(word, "load"), matches);
    }

    #[test]
    fn lines_are_cleaned_of_comments_and_blanks() {
        assert_eq!(clean_line("  load ram   "), "load ram");
        assert_eq!(clean_line("load ram # the ramdisk"), "load ram");
        assert_eq!(clean_line("# all comment"), "");
        assert_eq!(clean_line(""), "");
    }

    #[test]
    fn numbers_parse_in_decimal_and_hex() {
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x10"), Some(16));
        assert_eq!(parse_number("nope"), None);
        assert_eq!(parse_number(""), None);
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let gw = gateway();
        let out = gw.control().run_script("help").await;
        assert!(out.contains("Commands:"));
        assert!(out.contains("source filename"));
    }

    #[tokio::test]
    async fn load_registers_handler_and_module_dir() {
        let gw = gateway();
        gw.control().run_script("load ram").await;
        assert!(gw.registry().find("ram").is_some());
        assert!(gw.tree().lookup("/sys/module/ram").is_some());
    }

    #[tokio::test]
    async fn abbreviated_keywords_work() {
        let gw = gateway();
        gw.control().run_script("lo ram").await;
        assert!(gw.registry().find("ram").is_some());
    }

    #[tokio::test]
    async fn duplicate_load_reports_error() {
        let gw = gateway();
        let out = gw.control().run_script("load ram\nload ram").await;
        assert!(out.contains("already exists"));
    }

    #[tokio::test]
    async fn add_creates_device_node() {
        let gw = gateway();
        gw.control().run_script("load ram\nadd 0 /ram/@/1m").await;

        let node = gw.tree().lookup("/dev/ram000").expect("device node");
        let stat = gw.tree().stat(node).unwrap();
        assert_eq!(stat.size, 1 << 20);
        assert_eq!(stat.block_size, 4096);
        assert_eq!(stat.perm, 0o664);

        let device = gw.devices().get(0).unwrap();
        assert_eq!(device.dev_name(), "ram000");
    }

    #[tokio::test]
    async fn add_rejects_malformed_requests() {
        let gw = gateway();
        gw.control().run_script("load ram").await;

        let out = gw.control().run_script("add zero /ram/@").await;
        assert!(out.contains("Bad number"));

        let out = gw.control().run_script("add 9999 /ram/@").await;
        assert!(out.contains("Number too big"));

        let out = gw.control().run_script("add 0 ram/@").await;
        assert!(out.contains("Usage:"));

        let out = gw.control().run_script("add 0 /qcow/x").await;
        assert!(out.contains("device_add"));
    }

    #[tokio::test]
    async fn remove_drops_node_and_binding() {
        let gw = gateway();
        gw.control().run_script("load ram\nadd 0 /ram/@/1m").await;
        gw.control().run_script("remove 0").await;

        assert!(gw.tree().lookup("/dev/ram000").is_none());
        assert!(gw.devices().get(0).is_err());

        let out = gw.control().run_script("remove 0").await;
        assert!(out.contains("remove 0:"));
    }

    #[tokio::test]
    async fn unload_busy_while_devices_bound() {
        let gw = gateway();
        gw.control().run_script("load ram\nadd 0 /ram/@/1m").await;

        let out = gw.control().run_script("unload ram").await;
        assert!(out.contains("busy"));
        assert!(gw.registry().find("ram").is_some());

        gw.control().run_script("remove 0\nunload ram").await;
        assert!(gw.registry().find("ram").is_none());
        assert!(gw.tree().lookup("/sys/module/ram").is_none());
    }

    #[tokio::test]
    async fn comments_echo_and_blank_lines_are_accepted() {
        let gw = gateway();
        let out = gw
            .control()
            .run_script("# a comment\n\n   \necho hello there\n")
            .await;
        assert!(out.contains("> echo hello there"));
        assert!(!out.contains('?'));
    }

    #[tokio::test]
    async fn unknown_commands_get_a_hint() {
        let gw = gateway();
        let out = gw.control().run_script("frobnicate 12").await;
        assert!(out.contains("Try 'help'"));
    }

    #[tokio::test]
    async fn dump_shows_the_tree() {
        let gw = gateway();
        let out = gw.control().run_script("dump").await;
        assert!(out.contains("name='tcmur'"));
        assert!(out.contains("name='dev'"));
    }

    #[tokio::test]
    async fn source_runs_commands_from_file() {
        let gw = gateway();

        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "load ram").unwrap();
        writeln!(script, "add 1 /ram/@/1m").unwrap();
        script.flush().unwrap();

        gw.control()
            .run_script(&format!("source {}", script.path().display()))
            .await;

        assert!(gw.registry().find("ram").is_some());
        assert!(gw.tree().lookup("/dev/ram001").is_some());
    }

    #[tokio::test]
    async fn source_caps_script_size() {
        let gw = gateway();

        let mut script = tempfile::NamedTempFile::new().unwrap();
        script.write_all(&vec![b'#'; 8192]).unwrap();
        script.flush().unwrap();

        let out = gw
            .control()
            .run_script(&format!("source {}", script.path().display()))
            .await;
        assert!(out.contains("too large"));
    }

    #[tokio::test]
    async fn source_reports_missing_file() {
        let gw = gateway();
        let out = gw.control().run_script("source /no/such/script").await;
        assert!(out.contains("/no/such/script"));

        let out = gw.control().run_script("source relative.script").await;
        assert!(out.contains("relative to the server's CWD"));
    }

    #[tokio::test]
    async fn ctl_node_write_consumes_everything_and_read_pages_the_dump() {
        let gw = gateway();
        let ctl = gw.tree().lookup("/dev/tcmur").expect("control node");

        let cmd = b"load ram\n";
        let n = gw.tree().write(ctl, cmd, 0).await.unwrap();
        assert_eq!(n, cmd.len());
        assert!(gw.registry().find("ram").is_some());

        let head = gw.tree().read(ctl, 0, 16).await.unwrap();
        assert_eq!(head.len(), 16);
        let tail = gw.tree().read(ctl, 4, 16).await.unwrap();
        assert_eq!(&head[4..], &tail[..12]);

        // Past the end of the dump reads empty.
        let empty = gw.tree().read(ctl, 1 << 20, 16).await.unwrap();
        assert!(empty.is_empty());
    }
}
