use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::sys::syscall;

const READ_CHUNK: usize = 64 * 1024;
const MAX_IOVECS: usize = 64;

type ChangeCb = Box<dyn FnMut(usize, usize, usize) + Send>;

/// An ordered byte sequence stored as a chain of shared segments.
///
/// `Buffer` is reference counted: `clone` produces a second handle to the
/// same storage. [`add_ref`] shares another buffer's pages without copying,
/// while [`add_buffer`] moves them. A buffer may be handed to the pool inside
/// a transfer; the embedded lock makes that sound, and stays uncontended
/// because the submitting side only touches the buffer again after the
/// transfer completes.
///
/// [`add_ref`]: Buffer::add_ref
/// [`add_buffer`]: Buffer::add_buffer
#[derive(Clone, Default)]
pub struct Buffer {
    inner: Arc<Mutex<Inner>>,
    cb: Arc<Mutex<Option<ChangeCb>>>,
}

#[derive(Default)]
struct Inner {
    segs: VecDeque<Bytes>,
    scratch: BytesMut,
    len: usize,
    frozen_front: bool,
    frozen_back: bool,
}

impl Inner {
    fn push(&mut self, seg: Bytes) {
        if !seg.is_empty() {
            self.len += seg.len();
            self.segs.push_back(seg);
        }
    }

    fn drain_unchecked(&mut self, mut n: usize) {
        while n > 0 {
            let mut seg = match self.segs.pop_front() {
                Some(seg) => seg,
                None => return,
            };
            if n < seg.len() {
                let _ = seg.split_to(n);
                self.len -= n;
                self.segs.push_front(seg);
                return;
            }
            self.len -= seg.len();
            n -= seg.len();
        }
    }

    fn byte_at(&self, mut pos: usize) -> u8 {
        for seg in &self.segs {
            if pos < seg.len() {
                return seg[pos];
            }
            pos -= seg.len();
        }
        unreachable!("position out of bounds")
    }

    fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        if self.len < needle.len() {
            return None;
        }

        'outer: for start in 0..=(self.len - needle.len()) {
            for (i, &b) in needle.iter().enumerate() {
                if self.byte_at(start + i) != b {
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }

    fn copy_out(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for seg in &self.segs {
            if copied == dst.len() {
                break;
            }
            let n = (dst.len() - copied).min(seg.len());
            dst[copied..copied + n].copy_from_slice(&seg[..n]);
            copied += n;
        }
        copied
    }

    fn pullup(&mut self, n: usize) -> Bytes {
        let want = if n == 0 { self.len } else { n.min(self.len) };
        if want == 0 {
            return Bytes::new();
        }

        // Already contiguous: hand out the front segment without copying.
        if let Some(front) = self.segs.front() {
            if want <= front.len() {
                return front.slice(..want);
            }
        }

        let mut merged = BytesMut::with_capacity(want);
        let mut left = want;
        while left > 0 {
            let mut seg = self.segs.pop_front().unwrap();
            if left < seg.len() {
                let head = seg.split_to(left);
                merged.extend_from_slice(&head);
                self.segs.push_front(seg);
                left = 0;
            } else {
                left -= seg.len();
                merged.extend_from_slice(&seg);
            }
        }

        let merged = merged.freeze();
        self.segs.push_front(merged.clone());
        merged
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn from_bytes(data: &[u8]) -> Buffer {
        let buf = Buffer::new();
        let _ = buf.add(data);
        buf
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Two handles sharing the same storage?
    pub fn same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the contents out as a `String`, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let inner = self.lock();
        let mut out = Vec::with_capacity(inner.len);
        for seg in &inner.segs {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Classic offset/hex/ASCII dump for debugging.
    pub fn hexdump(&self) -> String {
        let data = self.to_vec();
        let mut out = String::new();
        for (i, chunk) in data.chunks(16).enumerate() {
            let _ = write!(out, "{:08x}  ", i * 16);
            for j in 0..16 {
                match chunk.get(j) {
                    Some(b) => {
                        let _ = write!(out, "{:02x} ", b);
                    }
                    None => out.push_str("   "),
                }
            }
            out.push(' ');
            for &b in chunk {
                out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
            }
            out.push('\n');
        }
        out
    }

    /// Register the mutation callback, invoked with
    /// `(added, deleted, original length)` after every change.
    pub fn set_callback<F>(&self, cb: F)
    where
        F: FnMut(usize, usize, usize) + Send + 'static,
    {
        *self.cb.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(cb));
    }

    pub fn clear_callback(&self) {
        *self.cb.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn changed(&self, added: usize, deleted: usize, orig: usize) {
        if added == 0 && deleted == 0 {
            return;
        }
        if let Some(cb) = self.cb.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            cb(added, deleted, orig);
        }
    }

    /// Forbid mutation at one end. `front` guards draining, the back guards
    /// appending.
    pub fn freeze(&self, enable: bool, front: bool) {
        let mut inner = self.lock();
        if front {
            inner.frozen_front = enable;
        } else {
            inner.frozen_back = enable;
        }
    }

    pub fn clear(&self) {
        let (deleted, orig);
        {
            let mut inner = self.lock();
            inner.frozen_front = false;
            orig = inner.len;
            deleted = inner.len;
            inner.segs.clear();
            inner.len = 0;
        }
        self.changed(0, deleted, orig);
    }

    /// Reserve at least `n` more bytes of contiguous space at the end.
    pub fn expand(&self, n: usize) {
        self.lock().scratch.reserve(n);
    }

    pub fn add(&self, data: &[u8]) -> Result<()> {
        let orig;
        {
            let mut inner = self.lock();
            if inner.frozen_back {
                return Err(Error::Buffer("back of buffer is frozen".into()));
            }
            orig = inner.len;
            inner.push(Bytes::copy_from_slice(data));
        }
        self.changed(data.len(), 0, orig);
        Ok(())
    }

    pub fn add_str(&self, s: &str) -> Result<()> {
        self.add(s.as_bytes())
    }

    /// Move the contents of `other` to the end of this buffer, draining it.
    pub fn add_buffer(&self, other: &Buffer) -> Result<()> {
        if self.same(other) {
            return Ok(());
        }

        let (added, orig, other_orig);
        {
            let mut src = other.lock();
            if src.frozen_front {
                return Err(Error::Buffer("front of buffer is frozen".into()));
            }
            let mut inner = self.lock();
            if inner.frozen_back {
                return Err(Error::Buffer("back of buffer is frozen".into()));
            }
            orig = inner.len;
            other_orig = src.len;
            added = src.len;
            while let Some(seg) = src.segs.pop_front() {
                inner.push(seg);
            }
            src.len = 0;
        }
        other.changed(0, other_orig, other_orig);
        self.changed(added, 0, orig);
        Ok(())
    }

    /// Append `other`'s contents by sharing its pages instead of copying.
    pub fn add_ref(&self, other: &Buffer) -> Result<()> {
        if self.same(other) {
            return Err(Error::Buffer("cannot add a buffer to itself".into()));
        }

        let (added, orig);
        {
            let src = other.lock();
            let mut inner = self.lock();
            if inner.frozen_back {
                return Err(Error::Buffer("back of buffer is frozen".into()));
            }
            orig = inner.len;
            added = src.len;
            for seg in &src.segs {
                inner.push(seg.clone());
            }
        }
        self.changed(added, 0, orig);
        Ok(())
    }

    /// Append the contents of the file at `path`.
    pub fn add_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::open(path.as_ref())
            .map_err(|e| Error::Buffer(format!("failed to open {:?}: {}", path.as_ref(), e)))?;

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = file
                .read(&mut chunk)
                .map_err(|e| Error::Buffer(format!("failed to read {:?}: {}", path.as_ref(), e)))?;
            if n == 0 {
                return Ok(());
            }
            self.add(&chunk[..n])?;
        }
    }

    pub fn prepend(&self, data: &[u8]) -> Result<()> {
        let orig;
        {
            let mut inner = self.lock();
            if inner.frozen_front {
                return Err(Error::Buffer("front of buffer is frozen".into()));
            }
            orig = inner.len;
            if !data.is_empty() {
                inner.segs.push_front(Bytes::copy_from_slice(data));
                inner.len += data.len();
            }
        }
        self.changed(data.len(), 0, orig);
        Ok(())
    }

    pub fn prepend_buffer(&self, other: &Buffer) -> Result<()> {
        if self.same(other) {
            return Ok(());
        }

        let (added, orig, other_orig);
        {
            let mut src = other.lock();
            let mut inner = self.lock();
            if inner.frozen_front {
                return Err(Error::Buffer("front of buffer is frozen".into()));
            }
            orig = inner.len;
            other_orig = src.len;
            added = src.len;
            while let Some(seg) = src.segs.pop_back() {
                if !seg.is_empty() {
                    inner.len += seg.len();
                    inner.segs.push_front(seg);
                }
            }
            src.len = 0;
        }
        other.changed(0, other_orig, other_orig);
        self.changed(added, 0, orig);
        Ok(())
    }

    /// Discard the first `n` bytes.
    pub fn drain(&self, n: usize) -> Result<()> {
        let orig;
        {
            let mut inner = self.lock();
            if inner.frozen_front {
                return Err(Error::Buffer("front of buffer is frozen".into()));
            }
            if inner.len < n {
                return Err(Error::Buffer(format!(
                    "cannot drain {} bytes from a buffer of {}",
                    n, inner.len
                )));
            }
            orig = inner.len;
            inner.drain_unchecked(n);
        }
        self.changed(0, n, orig);
        Ok(())
    }

    /// Move up to `dst.len()` bytes into `dst`, returning the count moved.
    pub fn remove(&self, dst: &mut [u8]) -> Result<usize> {
        let (moved, orig);
        {
            let mut inner = self.lock();
            if inner.frozen_front {
                return Err(Error::Buffer("front of buffer is frozen".into()));
            }
            orig = inner.len;
            moved = inner.copy_out(dst);
            inner.drain_unchecked(moved);
        }
        self.changed(0, moved, orig);
        Ok(moved)
    }

    /// Move up to `n` bytes into `dst` without copying the page contents.
    pub fn remove_buffer(&self, dst: &Buffer, n: usize) -> Result<usize> {
        if self.same(dst) {
            return Err(Error::Buffer("cannot move a buffer into itself".into()));
        }

        let (moved, orig, dst_orig);
        {
            let mut inner = self.lock();
            if inner.frozen_front {
                return Err(Error::Buffer("front of buffer is frozen".into()));
            }
            let mut out = dst.lock();
            if out.frozen_back {
                return Err(Error::Buffer("back of buffer is frozen".into()));
            }
            orig = inner.len;
            dst_orig = out.len;

            let mut left = n.min(inner.len);
            moved = left;
            while left > 0 {
                let mut seg = inner.segs.pop_front().unwrap();
                if left < seg.len() {
                    let head = seg.split_to(left);
                    inner.len -= left;
                    inner.segs.push_front(seg);
                    out.push(head);
                    break;
                }
                inner.len -= seg.len();
                left -= seg.len();
                out.push(seg);
            }
        }
        self.changed(0, moved, orig);
        dst.changed(moved, 0, dst_orig);
        Ok(moved)
    }

    /// Copy up to `dst.len()` bytes into `dst` without draining.
    pub fn copy_out(&self, dst: &mut [u8]) -> usize {
        self.lock().copy_out(dst)
    }

    /// Coalesce the first `n` bytes (0 meaning all) into one contiguous
    /// segment and return a shared handle to it.
    ///
    /// Nothing is drained; the chain is physically merged up to `n` so a
    /// subsequent `pullup` of the same span is free.
    pub fn pullup(&self, n: usize) -> Bytes {
        self.lock().pullup(n)
    }

    /// Offset of the first occurrence of `needle`, if any.
    pub fn index_of(&self, needle: &[u8]) -> Option<usize> {
        self.lock().find(needle)
    }

    /// Extract one line delimited by `eol`.
    ///
    /// Returns `Ok(None)` when no delimiter is found within `max` bytes
    /// (0 meaning unbounded). On success the line and its delimiter are
    /// drained.
    pub fn read_line(&self, max: usize, eol: &[u8]) -> Result<Option<String>> {
        let index = match self.index_of(eol) {
            Some(index) => index,
            None => return Ok(None),
        };
        if max != 0 && max < index {
            return Ok(None);
        }

        let mut line = vec![0u8; index];
        self.remove(&mut line)?;
        self.drain(eol.len())?;
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Scatter-gather write: `f` receives at least `n` bytes of writable
    /// space and returns how many it filled; that many are committed.
    pub fn reserve<F>(&self, n: usize, f: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let (written, orig);
        {
            let mut inner = self.lock();
            if inner.frozen_back {
                return Err(Error::Buffer("back of buffer is frozen".into()));
            }
            orig = inner.len;
            inner.scratch.resize(n, 0);
            written = f(&mut inner.scratch[..n]).min(n);
            inner.scratch.truncate(written);
            let seg = inner.scratch.split().freeze();
            inner.push(seg);
        }
        self.changed(written, 0, orig);
        Ok(written)
    }

    /// Scatter-gather read: `f` receives the readable chunks covering the
    /// first `n` bytes (0 meaning all) without draining them.
    pub fn peek<F, R>(&self, n: usize, f: F) -> R
    where
        F: FnOnce(&[&[u8]]) -> R,
    {
        let inner = self.lock();
        let want = if n == 0 { inner.len } else { n.min(inner.len) };

        let mut chunks: Vec<&[u8]> = Vec::new();
        let mut left = want;
        for seg in &inner.segs {
            if left == 0 {
                break;
            }
            let take = left.min(seg.len());
            chunks.push(&seg[..take]);
            left -= take;
        }
        f(&chunks)
    }

    /// Read up to `max` bytes from `fd` onto the end of the buffer.
    ///
    /// Returns `Ok(0)` at end of stream; would-block surfaces as an
    /// `io::Error` of kind `WouldBlock`.
    pub(crate) fn read_from_fd(&self, fd: RawFd, max: usize) -> io::Result<usize> {
        let (n, orig);
        {
            let mut inner = self.lock();
            let want = max.min(READ_CHUNK).max(1);
            orig = inner.len;
            inner.scratch.resize(want, 0);

            let res = syscall!(read(
                fd,
                inner.scratch.as_mut_ptr() as *mut libc::c_void,
                want,
            ));

            match res {
                Ok(count) => {
                    n = count as usize;
                    inner.scratch.truncate(n);
                    let seg = inner.scratch.split().freeze();
                    inner.push(seg);
                }
                Err(e) => return Err(e),
            }
        }
        self.changed(n, 0, orig);
        Ok(n)
    }

    /// Write up to `max` bytes from the front of the buffer to `fd`,
    /// draining what was written.
    pub(crate) fn write_to_fd(&self, fd: RawFd, max: usize) -> io::Result<usize> {
        let (n, orig);
        {
            let mut inner = self.lock();
            orig = inner.len;

            let mut iovecs: Vec<libc::iovec> = Vec::new();
            let mut left = max.min(inner.len);
            for seg in &inner.segs {
                if left == 0 || iovecs.len() == MAX_IOVECS {
                    break;
                }
                let take = left.min(seg.len());
                iovecs.push(libc::iovec {
                    iov_base: seg.as_ptr() as *mut libc::c_void,
                    iov_len: take,
                });
                left -= take;
            }

            if iovecs.is_empty() {
                return Ok(0);
            }

            let res = syscall!(writev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int));
            match res {
                Ok(count) => {
                    n = count as usize;
                    inner.drain_unchecked(n);
                }
                Err(e) => return Err(e),
            }
        }
        self.changed(0, n, orig);
        Ok(n)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_drain_remove() {
        let buf = Buffer::new();
        buf.add(b"hello ").unwrap();
        buf.add(b"world").unwrap();
        assert_eq!(buf.len(), 11);

        buf.drain(6).unwrap();
        let mut out = [0u8; 16];
        let n = buf.remove(&mut out).unwrap();
        assert_eq!(&out[..n], b"world");
        assert!(buf.is_empty());
    }

    #[test]
    fn index_of_spans_segments() {
        let buf = Buffer::new();
        buf.add(b"foo\r").unwrap();
        buf.add(b"\nbar").unwrap();
        assert_eq!(buf.index_of(b"\r\n"), Some(3));
        assert_eq!(buf.index_of(b"baz"), None);
    }

    #[test]
    fn read_line_drains_delimiter() {
        let buf = Buffer::new();
        buf.add(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap();

        let line = buf.read_line(0, b"\r\n").unwrap().unwrap();
        assert_eq!(line, "GET / HTTP/1.1");
        assert_eq!(buf.len(), 9);

        assert!(buf.read_line(2, b"\r\n").unwrap().is_none());
    }

    #[test]
    fn add_buffer_moves_and_add_ref_shares() {
        let a = Buffer::from_bytes(b"abc");
        let b = Buffer::from_bytes(b"def");

        a.add_buffer(&b).unwrap();
        assert_eq!(a.to_vec(), b"abcdef");
        assert!(b.is_empty());

        let c = Buffer::from_bytes(b"ghi");
        a.add_ref(&c).unwrap();
        assert_eq!(a.to_vec(), b"abcdefghi");
        assert_eq!(c.to_vec(), b"ghi");
    }

    #[test]
    fn clones_share_storage() {
        let a = Buffer::from_bytes(b"shared");
        let b = a.clone();
        b.drain(3).unwrap();
        assert_eq!(a.to_vec(), b"red");
    }

    #[test]
    fn frozen_ends_reject_mutation() {
        let buf = Buffer::from_bytes(b"data");

        buf.freeze(true, false);
        assert!(buf.add(b"x").is_err());
        buf.freeze(false, false);
        buf.add(b"x").unwrap();

        buf.freeze(true, true);
        assert!(buf.drain(1).is_err());
        buf.freeze(false, true);
        buf.drain(1).unwrap();
    }

    #[test]
    fn drain_past_end_fails() {
        let buf = Buffer::from_bytes(b"ab");
        assert!(buf.drain(3).is_err());
    }

    #[test]
    fn change_callback_reports_mutations() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let buf = Buffer::new();
        let added = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));

        let a = added.clone();
        let d = deleted.clone();
        buf.set_callback(move |add, del, _orig| {
            a.fetch_add(add, Ordering::SeqCst);
            d.fetch_add(del, Ordering::SeqCst);
        });

        buf.add(b"12345").unwrap();
        buf.drain(2).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 5);
        assert_eq!(deleted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reserve_and_peek() {
        let buf = Buffer::new();
        let n = buf
            .reserve(8, |space| {
                space[..3].copy_from_slice(b"xyz");
                3
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.len(), 3);

        buf.peek(0, |chunks| {
            let flat: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            assert_eq!(flat, b"xyz");
        });
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn pullup_coalesces_segments() {
        let buf = Buffer::new();
        buf.add(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        buf.add(b"hello").unwrap();
        buf.add(b" world").unwrap();
        let len = buf.len();

        let chunk = buf.pullup(0);
        assert_eq!(&chunk[..], b"HTTP/1.1 200 OK\r\n\r\nhello world");
        assert_eq!(buf.len(), len);

        // The merged span is now the front segment; repeating is free.
        let again = buf.pullup(0);
        assert_eq!(&again[..], &chunk[..]);

        // A partial pullup leaves the tail untouched.
        let buf = Buffer::new();
        buf.add(b"abc").unwrap();
        buf.add(b"def").unwrap();
        assert_eq!(&buf.pullup(4)[..], b"abcd");
        assert_eq!(buf.to_vec(), b"abcdef");

        assert!(buf.pullup(2).len() == 2);
        assert!(Buffer::new().pullup(0).is_empty());
    }

    #[test]
    fn remove_buffer_moves_pages() {
        let a = Buffer::from_bytes(b"0123456789");
        let b = Buffer::new();
        let n = a.remove_buffer(&b, 4).unwrap();
        assert_eq!(n, 4);
        assert_eq!(b.to_vec(), b"0123");
        assert_eq!(a.to_vec(), b"456789");
    }
}
