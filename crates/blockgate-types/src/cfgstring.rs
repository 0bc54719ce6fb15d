//! Device configuration strings.
//!
//! A cfgstring has the shape `/<subtype>/<handler-specific>`: the first
//! segment names the backend subtype, everything from the following `/`
//! onward belongs to the handler.

use crate::{Error, Result};

/// Upper bound on cfgstring length, including the handler-specific part.
pub const CFGSTRING_MAX: usize = 4096;

/// A parsed device configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgString {
    original: String,
    subtype: String,
    handler_cfg_at: usize,
}

impl CfgString {
    /// Parse and validate the shape of a cfgstring.
    ///
    /// Leading slashes are collapsed when extracting the subtype; the
    /// subtype itself is the initial alphanumeric run.
    pub fn parse(s: &str) -> Result<CfgString> {
        if !s.starts_with('/') {
            return Err(Error::Invalid(format!(
                "config string must start with '/': '{s}'"
            )));
        }
        if s.len() >= CFGSTRING_MAX {
            return Err(Error::Invalid(format!(
                "config string too long ({}/{})",
                s.len(),
                CFGSTRING_MAX - 1
            )));
        }

        let slashes = s.len() - s.trim_start_matches('/').len();
        let body = &s[slashes..];
        let subtype: String = body
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        if subtype.is_empty() {
            return Err(Error::Invalid(format!(
                "config string has no subtype segment: '{s}'"
            )));
        }

        Ok(CfgString {
            subtype,
            handler_cfg_at: slashes + body
                .find('/')
                .unwrap_or(body.len()),
            original: s.to_string(),
        })
    }

    /// The full original string.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// The backend subtype named by the first segment.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// The handler-specific remainder, starting at its leading `/`
    /// (empty when the string is just `/<subtype>`).
    pub fn handler_cfg(&self) -> &str {
        &self.original[self.handler_cfg_at..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_subtype_and_handler_cfg() {
        let cfg = CfgString::parse("/ram/@").unwrap();
        assert_eq!(cfg.subtype(), "ram");
        assert_eq!(cfg.handler_cfg(), "/@");
    }

    #[test]
    fn handler_cfg_keeps_leading_slash_as_path() {
        let cfg = CfgString::parse("/file/tmp/disk.img").unwrap();
        assert_eq!(cfg.subtype(), "file");
        assert_eq!(cfg.handler_cfg(), "/tmp/disk.img");
    }

    #[test]
    fn bare_subtype_has_empty_handler_cfg() {
        let cfg = CfgString::parse("/ram").unwrap();
        assert_eq!(cfg.subtype(), "ram");
        assert_eq!(cfg.handler_cfg(), "");
    }

    #[test]
    fn rejects_missing_leading_slash() {
        assert!(CfgString::parse("ram/@").is_err());
    }

    #[test]
    fn rejects_empty_subtype() {
        assert!(CfgString::parse("//").is_err());
        assert!(CfgString::parse("/").is_err());
    }

    #[test]
    fn rejects_overlong_string() {
        let s = format!("/ram/{}", "x".repeat(CFGSTRING_MAX));
        assert!(CfgString::parse(&s).is_err());
    }

    #[test]
    fn tolerates_doubled_leading_slash() {
        let cfg = CfgString::parse("//ram/@").unwrap();
        assert_eq!(cfg.subtype(), "ram");
        assert_eq!(cfg.handler_cfg(), "/@");
    }
}
