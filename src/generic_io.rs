//! Unified stream abstraction over files, memory buffers, forward-only
//! streams, and HTTP sources.
//!
//! # Capabilities
//!
//! Every backend reports `seekable()` and `writable()`.  Reading works on
//! all of them; non-seekable streams still support bounded lookahead via an
//! internal buffer, which is what the header scanner needs to find the YAML
//! end marker and the first block magic without over-reading.  Writes,
//! truncation, and in-place updates require a seekable, writable backend.
//!
//! # Backends
//!
//! | Backend       | seek | write | notes                                   |
//! |---------------|------|-------|-----------------------------------------|
//! | [`FileIo`]    | yes  | mode  | random-access file                      |
//! | [`MemoryIo`]  | yes  | mode  | shared in-memory buffer                 |
//! | [`InputStream`] | no | no    | forward-only reader with lookahead      |
//! | [`HttpIo`]    | yes  | no    | ranged GETs when the server allows them |
//!
//! An `http(s)` URL whose server does not advertise `Accept-Ranges: bytes`
//! is downloaded once and served from memory.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use url::Url;

use crate::error::{AsdfError, Result};

/// Buffer granularity for scanning reads and padding calculations.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Open mode, mirroring `r` / `rw` / `w`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    ReadWrite,
    Write,
}

impl Mode {
    fn writable(self) -> bool {
        !matches!(self, Mode::Read)
    }
}

// ── Trait ────────────────────────────────────────────────────────────────────

pub trait GenericIo {
    /// The URI this stream was opened from, when one is known.
    fn uri(&self) -> Option<&str>;

    fn seekable(&self) -> bool;
    fn writable(&self) -> bool;

    fn block_size(&self) -> usize {
        DEFAULT_BLOCK_SIZE
    }

    /// Current logical position (bytes consumed from the start).
    fn tell(&mut self) -> Result<u64>;

    /// Absolute seek.  Fails with `NotSeekable` on forward-only streams.
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Read up to `buf.len()` bytes; returns 0 at EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Return up to `n` bytes of lookahead without consuming them.
    /// Fewer than `n` bytes means EOF is within reach.
    fn peek(&mut self, n: usize) -> Result<&[u8]>;

    /// Discard `n` bytes previously observed via `peek` (or skip forward).
    fn consume(&mut self, n: usize) -> Result<()>;

    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn truncate(&mut self, len: u64) -> Result<()>;

    /// Advance without retaining data.  Works on every backend; on
    /// non-seekable streams the bytes are read and dropped.
    fn fast_forward(&mut self, n: u64) -> Result<()>;
}

/// Shared handle to a stream; lazily loaded block payloads keep a weak
/// reference to this so that a closed engine invalidates them.
pub type SharedIo = Rc<RefCell<Box<dyn GenericIo>>>;

// ── Common helpers ───────────────────────────────────────────────────────────

pub fn read_exact(io: &mut dyn GenericIo, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(AsdfError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {} more bytes", buf.len() - filled),
            )));
        }
        filled += n;
    }
    Ok(())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read bytes until `finder` reports a match.
///
/// `finder` receives the accumulated lookahead and whether EOF has been
/// reached, and returns the `(start, end)` byte span of the delimiter.
/// With `include == true` the returned region runs through `end`,
/// otherwise it stops at `start` and the delimiter stays in the stream.
/// A miss at EOF is an `InvalidData` error naming `what`.
pub fn read_until<F>(
    io: &mut dyn GenericIo,
    what: &str,
    include: bool,
    finder: F,
) -> Result<Vec<u8>>
where
    F: Fn(&[u8], bool) -> Option<(usize, usize)>,
{
    let chunk = io.block_size();
    let mut want = chunk;
    loop {
        let buf = io.peek(want)?;
        let at_eof = buf.len() < want;
        if let Some((start, end)) = finder(buf, at_eof) {
            let cut = if include { end } else { start };
            let out = buf[..cut].to_vec();
            io.consume(cut)?;
            return Ok(out);
        }
        if at_eof {
            return Err(AsdfError::io_invalid(format!("{what} not found")));
        }
        want += chunk;
    }
}

/// Scan forward for `target`, consuming everything up to it.
///
/// Returns `false` when EOF is reached without a match (the stream is left
/// at EOF).  With `include == true` the target itself is consumed too.
pub fn seek_until(io: &mut dyn GenericIo, target: &[u8], include: bool) -> Result<bool> {
    let chunk = io.block_size().max(target.len() * 2);
    loop {
        let buf = io.peek(chunk)?;
        if buf.is_empty() {
            return Ok(false);
        }
        let at_eof = buf.len() < chunk;
        if let Some(i) = find_subsequence(buf, target) {
            io.consume(i + if include { target.len() } else { 0 })?;
            return Ok(true);
        }
        if at_eof {
            let n = buf.len();
            io.consume(n)?;
            return Ok(false);
        }
        // Keep a tail shorter than the target so a match straddling the
        // chunk boundary is still seen on the next pass.
        let n = buf.len() - (target.len() - 1);
        io.consume(n)?;
    }
}

/// Padding to append after `content_size` bytes.
///
/// `None` adds nothing.  `Default` grows the extent by 10% and rounds the
/// total up to the next multiple of `block_size`, plus one more block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pad {
    None,
    Default,
    Factor(f64),
}

impl Default for Pad {
    fn default() -> Self {
        Pad::None
    }
}

pub fn calculate_padding(content_size: u64, pad: Pad, block_size: usize) -> u64 {
    let factor = match pad {
        Pad::None => return 0,
        Pad::Default => 1.1,
        Pad::Factor(f) => f,
    };
    let target = content_size as f64 * factor;
    let blocks = (target / block_size as f64).ceil() + 1.0;
    let new_size = (blocks * block_size as f64) as u64;
    new_size.saturating_sub(content_size)
}

// ── URI handling ─────────────────────────────────────────────────────────────

/// Resolve `rel` against `base`.  An absolute `rel` wins; with no base the
/// relative form is returned untouched.
pub fn resolve_uri(base: Option<&str>, rel: &str) -> String {
    if Url::parse(rel).is_ok() {
        return rel.to_string();
    }
    match base.and_then(|b| Url::parse(b).ok()) {
        Some(b) => match b.join(rel) {
            Ok(u) => u.to_string(),
            Err(_) => rel.to_string(),
        },
        None => rel.to_string(),
    }
}

/// Strip the fragment, keeping everything before `#`.
pub fn get_base_uri(uri: &str) -> &str {
    match uri.find('#') {
        Some(i) => &uri[..i],
        None => uri,
    }
}

pub fn path_to_uri(path: &Path) -> Result<String> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&abs)
        .map(|u| u.to_string())
        .map_err(|_| AsdfError::io_invalid(format!("unrepresentable path {}", abs.display())))
}

fn uri_to_path(uri: &str) -> Option<std::path::PathBuf> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() == "file" {
        url.to_file_path().ok()
    } else {
        None
    }
}

/// File name (no directory) of the `n`-th external sibling of `base`:
/// `dir/name.asdf` becomes `name0000.asdf`, `name0001.asdf`, ...
pub fn external_name(base: &str, n: usize) -> String {
    let name = base.rsplit('/').next().unwrap_or(base);
    let stem = match name.rfind('.') {
        Some(i) => &name[..i],
        None => name,
    };
    format!("{stem}{n:04}.asdf")
}

/// Absolute URI of the `n`-th external sibling of `base`.
pub fn external_uri(base: &str, n: usize) -> String {
    resolve_uri(Some(base), &external_name(base, n))
}

// ── Constructors ─────────────────────────────────────────────────────────────

/// Open a stream from a URI or a bare filesystem path.
pub fn open_uri(uri: &str, mode: Mode) -> Result<Box<dyn GenericIo>> {
    if let Ok(url) = Url::parse(uri) {
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| AsdfError::io_invalid(format!("bad file URI {uri}")))?;
                return FileIo::open(&path, mode).map(|f| Box::new(f) as Box<dyn GenericIo>);
            }
            "http" | "https" => {
                if mode.writable() {
                    return Err(AsdfError::NotWritable);
                }
                return HttpIo::open(uri);
            }
            // Single-letter schemes are Windows drive prefixes, not URIs.
            s if s.len() > 1 => {
                return Err(AsdfError::io_invalid(format!("unsupported URI scheme {s}")));
            }
            _ => {}
        }
    }
    FileIo::open(Path::new(uri), mode).map(|f| Box::new(f) as Box<dyn GenericIo>)
}

// ── FileIo ───────────────────────────────────────────────────────────────────

/// Random-access file stream.
///
/// Lookahead is held in `ahead`: bytes the OS file has already yielded but
/// the logical position has not passed.  Any seek or write first discards
/// it and realigns the OS position with the logical one.
pub struct FileIo {
    file: File,
    uri: Option<String>,
    writable: bool,
    ahead: VecDeque<u8>,
}

impl FileIo {
    pub fn open(path: &Path, mode: Mode) -> Result<Self> {
        let file = match mode {
            Mode::Read => File::open(path)?,
            Mode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            Mode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        };
        let uri = path_to_uri(path).ok();
        Ok(Self {
            file,
            uri,
            writable: mode.writable(),
            ahead: VecDeque::new(),
        })
    }

    /// Move the OS position back over unconsumed lookahead.
    fn realign(&mut self) -> Result<()> {
        if !self.ahead.is_empty() {
            let back = self.ahead.len() as i64;
            self.file.seek(SeekFrom::Current(-back))?;
            self.ahead.clear();
        }
        Ok(())
    }
}

impl GenericIo for FileIo {
    fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    fn seekable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn tell(&mut self) -> Result<u64> {
        let raw = self.file.stream_position()?;
        Ok(raw - self.ahead.len() as u64)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.ahead.clear();
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.ahead.is_empty() {
            let n = buf.len().min(self.ahead.len());
            for (i, b) in self.ahead.drain(..n).enumerate() {
                buf[i] = b;
            }
            return Ok(n);
        }
        Ok(self.file.read(buf)?)
    }

    fn peek(&mut self, n: usize) -> Result<&[u8]> {
        while self.ahead.len() < n {
            let mut chunk = vec![0u8; n - self.ahead.len()];
            let got = self.file.read(&mut chunk)?;
            if got == 0 {
                break;
            }
            self.ahead.extend(&chunk[..got]);
        }
        let avail = self.ahead.len().min(n);
        Ok(&self.ahead.make_contiguous()[..avail])
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        if n <= self.ahead.len() {
            self.ahead.drain(..n);
        } else {
            let rest = (n - self.ahead.len()) as i64;
            self.ahead.clear();
            self.file.seek(SeekFrom::Current(rest))?;
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(AsdfError::NotWritable);
        }
        self.realign()?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(AsdfError::NotWritable);
        }
        self.realign()?;
        self.file.set_len(len)?;
        Ok(())
    }

    fn fast_forward(&mut self, n: u64) -> Result<()> {
        self.consume(usize::try_from(n).unwrap_or(usize::MAX))
    }
}

// ── MemoryIo ─────────────────────────────────────────────────────────────────

/// In-memory stream over a shared buffer.
///
/// `handle()` returns a second view over the same bytes with an independent
/// position, which is how a caller gets the written content back after the
/// engine is done with its copy.
pub struct MemoryIo {
    buf: Rc<RefCell<Vec<u8>>>,
    pos: usize,
    writable: bool,
    uri: Option<String>,
    scratch: Vec<u8>,
}

impl MemoryIo {
    pub fn new() -> Self {
        Self::from_vec(Vec::new(), Mode::ReadWrite)
    }

    pub fn from_vec(data: Vec<u8>, mode: Mode) -> Self {
        Self {
            buf: Rc::new(RefCell::new(data)),
            pos: 0,
            writable: mode.writable(),
            uri: None,
            scratch: Vec::new(),
        }
    }

    /// A second, rewound view over the same buffer.
    pub fn handle(&self) -> MemoryIo {
        Self {
            buf: Rc::clone(&self.buf),
            pos: 0,
            writable: self.writable,
            uri: self.uri.clone(),
            scratch: Vec::new(),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIo {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericIo for MemoryIo {
    fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    fn seekable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos as u64)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos as usize;
        Ok(())
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        let buf = self.buf.borrow();
        if self.pos >= buf.len() {
            return Ok(0);
        }
        let n = out.len().min(buf.len() - self.pos);
        out[..n].copy_from_slice(&buf[self.pos..self.pos + n]);
        drop(buf);
        self.pos += n;
        Ok(n)
    }

    fn peek(&mut self, n: usize) -> Result<&[u8]> {
        let buf = self.buf.borrow();
        let end = (self.pos + n).min(buf.len());
        let start = self.pos.min(buf.len());
        self.scratch.clear();
        self.scratch.extend_from_slice(&buf[start..end]);
        Ok(&self.scratch)
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        self.pos += n;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(AsdfError::NotWritable);
        }
        let mut buf = self.buf.borrow_mut();
        if self.pos > buf.len() {
            buf.resize(self.pos, 0);
        }
        let overlap = (buf.len() - self.pos).min(data.len());
        buf[self.pos..self.pos + overlap].copy_from_slice(&data[..overlap]);
        buf.extend_from_slice(&data[overlap..]);
        drop(buf);
        self.pos += data.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(AsdfError::NotWritable);
        }
        self.buf.borrow_mut().truncate(len as usize);
        Ok(())
    }

    fn fast_forward(&mut self, n: u64) -> Result<()> {
        self.pos += n as usize;
        Ok(())
    }
}

// ── InputStream ──────────────────────────────────────────────────────────────

/// Forward-only stream: no seeking, no writing, but full lookahead support
/// through an internal ring buffer, so header scanning still works.
pub struct InputStream {
    inner: Box<dyn Read>,
    ahead: VecDeque<u8>,
    pos: u64,
    uri: Option<String>,
}

impl InputStream {
    pub fn new(inner: Box<dyn Read>, uri: Option<String>) -> Self {
        Self {
            inner,
            ahead: VecDeque::new(),
            pos: 0,
            uri,
        }
    }
}

impl GenericIo for InputStream {
    fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    fn seekable(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        false
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn seek(&mut self, _pos: u64) -> Result<()> {
        Err(AsdfError::NotSeekable)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.ahead.is_empty() {
            let n = buf.len().min(self.ahead.len());
            for (i, b) in self.ahead.drain(..n).enumerate() {
                buf[i] = b;
            }
            self.pos += n as u64;
            return Ok(n);
        }
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn peek(&mut self, n: usize) -> Result<&[u8]> {
        while self.ahead.len() < n {
            let mut chunk = vec![0u8; n - self.ahead.len()];
            let got = self.inner.read(&mut chunk)?;
            if got == 0 {
                break;
            }
            self.ahead.extend(&chunk[..got]);
        }
        let avail = self.ahead.len().min(n);
        Ok(&self.ahead.make_contiguous()[..avail])
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        let buffered = n.min(self.ahead.len());
        self.ahead.drain(..buffered);
        self.pos += buffered as u64;
        let mut rest = n - buffered;
        let mut sink = [0u8; 512];
        while rest > 0 {
            let want = rest.min(sink.len());
            let got = self.inner.read(&mut sink[..want])?;
            if got == 0 {
                break;
            }
            self.pos += got as u64;
            rest -= got;
        }
        Ok(())
    }

    fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
        Err(AsdfError::NotWritable)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, _len: u64) -> Result<()> {
        Err(AsdfError::NotWritable)
    }

    fn fast_forward(&mut self, n: u64) -> Result<()> {
        self.consume(usize::try_from(n).unwrap_or(usize::MAX))
    }
}

// ── HttpIo ───────────────────────────────────────────────────────────────────

/// Remote read-only stream using HTTP range requests.
pub struct HttpIo {
    client: reqwest::blocking::Client,
    url: String,
    len: u64,
    pos: u64,
    ahead: Vec<u8>,
}

impl HttpIo {
    /// Probe the server; fall back to a full in-memory download when range
    /// requests are not supported.
    pub fn open(url: &str) -> Result<Box<dyn GenericIo>> {
        let client = reqwest::blocking::Client::new();
        let resp = client.head(url).send()?;
        let ranges_ok = resp
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .map(|v| v.as_bytes() == b"bytes")
            .unwrap_or(false);
        let len = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if let (true, Some(len)) = (ranges_ok, len) {
            return Ok(Box::new(Self {
                client,
                url: url.to_string(),
                len,
                pos: 0,
                ahead: Vec::new(),
            }));
        }

        log::debug!("{url}: no range support, downloading whole body");
        let body = client.get(url).send()?.error_for_status()?.bytes()?;
        let mut mem = MemoryIo::from_vec(body.to_vec(), Mode::Read);
        mem.uri = Some(url.to_string());
        Ok(Box::new(mem))
    }

    fn fetch(&self, start: u64, n: usize) -> Result<Vec<u8>> {
        if start >= self.len || n == 0 {
            return Ok(Vec::new());
        }
        let end = (start + n as u64 - 1).min(self.len - 1);
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()?
            .error_for_status()?;
        Ok(resp.bytes()?.to_vec())
    }
}

impl GenericIo for HttpIo {
    fn uri(&self) -> Option<&str> {
        Some(&self.url)
    }

    fn seekable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        false
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        self.ahead.clear();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.ahead.is_empty() {
            let n = buf.len().min(self.ahead.len());
            buf[..n].copy_from_slice(&self.ahead[..n]);
            self.ahead.drain(..n);
            self.pos += n as u64;
            return Ok(n);
        }
        let data = self.fetch(self.pos, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }

    fn peek(&mut self, n: usize) -> Result<&[u8]> {
        if self.ahead.len() < n {
            let start = self.pos + self.ahead.len() as u64;
            let more = self.fetch(start, n - self.ahead.len())?;
            self.ahead.extend_from_slice(&more);
        }
        let avail = self.ahead.len().min(n);
        Ok(&self.ahead[..avail])
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        let buffered = n.min(self.ahead.len());
        self.ahead.drain(..buffered);
        self.pos += n as u64;
        Ok(())
    }

    fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
        Err(AsdfError::NotWritable)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, _len: u64) -> Result<()> {
        Err(AsdfError::NotWritable)
    }

    fn fast_forward(&mut self, n: u64) -> Result<()> {
        self.consume(usize::try_from(n).unwrap_or(usize::MAX))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_disabled() {
        assert_eq!(calculate_padding(1000, Pad::None, 4096), 0);
    }

    #[test]
    fn padding_default_rounds_to_block() {
        let pad = calculate_padding(1000, Pad::Default, 4096);
        assert_eq!((1000 + pad) % 4096, 0);
        assert!(pad > 0);
    }

    #[test]
    fn seek_until_straddles_chunks() {
        let mut data = vec![b'x'; DEFAULT_BLOCK_SIZE - 2];
        data.extend_from_slice(b"MAGC tail");
        let mut io = MemoryIo::from_vec(data, Mode::Read);
        assert!(seek_until(&mut io, b"MAGC", true).unwrap());
        assert_eq!(io.tell().unwrap(), DEFAULT_BLOCK_SIZE as u64 + 2);
    }

    #[test]
    fn seek_until_miss_hits_eof() {
        let mut io = MemoryIo::from_vec(vec![b'y'; 100], Mode::Read);
        assert!(!seek_until(&mut io, b"MAGC", true).unwrap());
    }

    #[test]
    fn input_stream_peek_does_not_consume() {
        let data: Vec<u8> = (0..32).collect();
        let mut io = InputStream::new(Box::new(std::io::Cursor::new(data)), None);
        assert_eq!(io.peek(4).unwrap(), &[0, 1, 2, 3]);
        let mut buf = [0u8; 4];
        assert_eq!(io.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(io.tell().unwrap(), 4);
    }

    #[test]
    fn memory_overwrite_mid_buffer() {
        let mut io = MemoryIo::from_vec(b"0123456789".to_vec(), Mode::ReadWrite);
        io.seek(3).unwrap();
        io.write_all(b"abc").unwrap();
        assert_eq!(io.contents(), b"012abc6789");
    }

    #[test]
    fn external_sibling_names() {
        assert_eq!(external_name("file:///tmp/test.asdf", 0), "test0000.asdf");
        assert_eq!(external_name("file:///tmp/test.asdf", 12), "test0012.asdf");
        assert_eq!(
            external_uri("file:///tmp/test.asdf", 1),
            "file:///tmp/test0001.asdf"
        );
    }

    #[test]
    fn resolve_relative_against_base() {
        assert_eq!(
            resolve_uri(Some("file:///a/b/c.asdf"), "d.asdf"),
            "file:///a/b/d.asdf"
        );
        assert_eq!(
            resolve_uri(Some("file:///a/b/c.asdf"), "file:///x.asdf"),
            "file:///x.asdf"
        );
    }
}
