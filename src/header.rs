//! The hybrid file's text framing: version line and YAML region limits.
//!
//! A file starts with `#ASDF <major>.<minor>.<micro>\n` (an optional CR
//! before the LF is tolerated).  The four bytes after the newline decide
//! what follows: `%YAM` opens a YAML region that runs through the document
//! end marker (`...` at line start, final newline optional at EOF); the
//! block magic means the binary region starts immediately; EOF means an
//! empty file; anything else is garbage.

use std::fmt;
use std::sync::OnceLock;

use regex::bytes::Regex;

use crate::constants::{ASDF_MAGIC, BLOCK_MAGIC, YAML_TOKEN};
use crate::error::{AsdfError, Result};
use crate::generic_io::{read_until, GenericIo};

/// Longest version line we are willing to scan for a newline.
const MAX_HEADER_LINE: usize = 64;

// ── Version ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl Version {
    pub const DEFAULT: Version = Version {
        major: 0,
        minor: 1,
        micro: 0,
    };
}

impl Default for Version {
    fn default() -> Self {
        Version::DEFAULT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

fn version_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#ASDF (?P<major>[0-9]+)\.(?P<minor>[0-9]+)\.(?P<micro>[0-9]+)").unwrap())
}

/// Parse the version triple out of a header line.
pub fn parse_version_line(line: &[u8]) -> Result<Version> {
    let caps = version_line_re().captures(line).ok_or(AsdfError::NotAsdf)?;
    let field = |name: &str| -> u32 {
        // The pattern guarantees ASCII digits.
        std::str::from_utf8(caps.name(name).unwrap().as_bytes())
            .unwrap()
            .parse()
            .unwrap_or(0)
    };
    Ok(Version {
        major: field("major"),
        minor: field("minor"),
        micro: field("micro"),
    })
}

/// Read and parse the version line at the current stream position.
pub fn read_version_line(io: &mut dyn GenericIo) -> Result<Version> {
    let line = read_until(io, "newline", true, |buf, at_eof| {
        if let Some(i) = buf.iter().position(|&b| b == b'\n') {
            return Some((i, i + 1));
        }
        if at_eof || buf.len() >= MAX_HEADER_LINE {
            // No newline in reach; let the version parse reject it.
            return Some((buf.len(), buf.len()));
        }
        None
    })
    .map_err(|_| AsdfError::NotAsdf)?;
    parse_version_line(&line)
}

pub fn write_version_line(io: &mut dyn GenericIo, version: Version) -> Result<()> {
    io.write_all(ASDF_MAGIC)?;
    io.write_all(version.to_string().as_bytes())?;
    io.write_all(b"\n")
}

// ── Region token ─────────────────────────────────────────────────────────────

/// What follows the version line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderToken {
    Yaml,
    Block,
    Eof,
}

/// Classify the four bytes after the version line without consuming
/// anything past them.
pub fn read_token(io: &mut dyn GenericIo) -> Result<HeaderToken> {
    let token = io.peek(4)?.to_vec();
    if token.is_empty() {
        return Ok(HeaderToken::Eof);
    }
    if token == YAML_TOKEN {
        io.consume(4)?;
        return Ok(HeaderToken::Yaml);
    }
    if token == BLOCK_MAGIC {
        io.consume(4)?;
        return Ok(HeaderToken::Block);
    }
    Err(AsdfError::GarbageAfterHeader)
}

// ── YAML region ──────────────────────────────────────────────────────────────

/// Find the document end marker `...` at the start of a line, followed by
/// a newline or the end of input.  Returns `(match_start, region_end)`.
fn find_yaml_end(buf: &[u8], at_eof: bool) -> Option<(usize, usize)> {
    let mut search_from = 0;
    while let Some(rel) = buf[search_from..]
        .windows(4)
        .position(|w| w == b"\n...")
    {
        let start = search_from + rel;
        let after = start + 4;
        match buf.get(after) {
            Some(b'\n') => return Some((start, after + 1)),
            Some(b'\r') => match buf.get(after + 1) {
                Some(b'\n') => return Some((start, after + 2)),
                Some(_) => {}
                // Bare CR at the buffer edge: undecidable until EOF.
                None if !at_eof => return None,
                None => {}
            },
            Some(_) => {}
            // Marker flush against the buffer edge.
            None if at_eof => return Some((start, after)),
            None => return None,
        }
        search_from = start + 1;
    }
    None
}

/// Read the YAML region, end marker included.  The caller has consumed the
/// leading `%YAM` token, which is re-prepended here.
pub fn read_yaml_region(io: &mut dyn GenericIo) -> Result<Vec<u8>> {
    let rest = read_until(io, "end of YAML marker", true, find_yaml_end)?;
    let mut region = Vec::with_capacity(4 + rest.len());
    region.extend_from_slice(YAML_TOKEN);
    region.extend_from_slice(&rest);
    Ok(region)
}
