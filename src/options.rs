//! Mount option parsing
//!
//! The session consumes a comma-separated `key=value` option string of the
//! form mount(8) passes down. Only the options the core itself uses are
//! interpreted; everything else belongs to higher layers and is ignored.

use crate::error::Error;
use crate::fcall::ProtoVersion;

/// Default negotiation size when no `msize=` option is given.
pub const DEFAULT_MSIZE: u32 = 8192;

/// Options the session consumes from the mount option string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Preferred msize to offer in `Tversion`.
    pub msize: u32,
    /// Protocol ceiling; negotiation may still downgrade from here.
    pub version: ProtoVersion,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            msize: DEFAULT_MSIZE,
            version: ProtoVersion::Linux,
        }
    }
}

impl SessionOptions {
    /// Parse a mount option string.
    ///
    /// Recognized tokens: `msize=<u32>`, `trans=<name>` (only `virtio`),
    /// `version=9p2000|9p2000.u|9p2000.L`, and `noextend` as shorthand for
    /// `version=9p2000`. Unknown tokens are ignored; malformed values for
    /// recognized keys are an error.
    pub fn parse(options: &str) -> Result<SessionOptions, Error> {
        let mut parsed = SessionOptions::default();
        for token in options.split(',') {
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some(("msize", value)) => {
                    parsed.msize = value.parse().map_err(|_| Error::InvalidArgument)?;
                }
                Some(("trans", value)) => {
                    if value != "virtio" {
                        return Err(Error::InvalidArgument);
                    }
                }
                Some(("version", value)) => {
                    parsed.version =
                        ProtoVersion::from_option(value).ok_or(Error::InvalidArgument)?;
                }
                None if token == "noextend" => {
                    parsed.version = ProtoVersion::Legacy;
                }
                _ => {}
            }
        }
        Ok(parsed)
    }
}
