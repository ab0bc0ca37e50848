//-
// Copyright (c) 2024, Postbag Developers
//
// This file is part of Postbag.
//
// Postbag is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postbag is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postbag. If not, see <http://www.gnu.org/licenses/>.

use std::io::{Read, Seek};

use crate::support::error::Error;

/// A pull-based byte source over a seekable stream.
///
/// Reads happen in large chunks for throughput, while the consumer sees
/// single-byte `next`/`peek` plus a bulk `window`/`consume` interface. A
/// refill slides a small retained region to the front of the buffer so that
/// a delimiter match spanning the refill boundary is never lost and a
/// recently consumed byte can still be pushed back.
pub(super) struct ByteCursor<R> {
    inner: R,
    buf: Vec<u8>,
    /// Next byte to hand out. Invariant: `cursor <= valid_end <= buf.len()`.
    cursor: usize,
    /// End of valid data in `buf`.
    valid_end: usize,
    /// Bytes before the cursor to retain across a refill, sized from the
    /// active delimiter so `push_back` after a failed match stays legal.
    keep_before: usize,
    chunk: usize,
    consumed_call: usize,
    consumed_total: u64,
}

impl<R: Read + Seek> ByteCursor<R> {
    pub fn new(inner: R, chunk: usize, delimiter_slack: usize) -> Self {
        // 2 x chunk plus delimiter slack; the lower bound keeps a window
        // big enough to decide a match even under absurdly small chunks.
        let capacity = (2 * chunk).max(2 * delimiter_slack) + delimiter_slack;
        ByteCursor {
            inner,
            buf: vec![0; capacity],
            cursor: 0,
            valid_end: 0,
            keep_before: 0,
            chunk: chunk.max(1),
            consumed_call: 0,
            consumed_total: 0,
        }
    }

    /// Sets how many already-consumed bytes survive a refill.
    pub fn set_keep_before(&mut self, n: usize) {
        self.keep_before = n;
    }

    /// Resets the per-call consumed counter. Called once per parse call.
    pub fn begin_call(&mut self) {
        self.consumed_call = 0;
    }

    pub fn consumed_this_call(&self) -> usize {
        self.consumed_call
    }

    pub fn consumed_total(&self) -> u64 {
        self.consumed_total
    }

    /// The unconsumed bytes currently visible.
    pub fn window(&self) -> &[u8] {
        &self.buf[self.cursor..self.valid_end]
    }

    /// Consumes `n` bytes of the window.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.valid_end - self.cursor);
        self.cursor += n;
        self.consumed_call += n;
        self.consumed_total += n as u64;
    }

    pub fn next(&mut self) -> Result<Option<u8>, Error> {
        if self.cursor == self.valid_end && self.refill()? == 0 {
            return Ok(None);
        }
        let byte = self.buf[self.cursor];
        self.consume(1);
        Ok(Some(byte))
    }

    pub fn peek(&mut self) -> Result<Option<u8>, Error> {
        if self.cursor == self.valid_end && self.refill()? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[self.cursor]))
    }

    /// Returns the most recently consumed byte to the window.
    ///
    /// Only legal while the cursor has not reached the start of the buffer;
    /// anything else is a contract violation in the caller, reported as an
    /// error rather than silently ignored.
    pub fn push_back(&mut self) -> Result<(), Error> {
        if self.cursor == 0 {
            return Err(Error::PushBackOverflow);
        }
        self.cursor -= 1;
        self.consumed_call = self.consumed_call.saturating_sub(1);
        self.consumed_total -= 1;
        Ok(())
    }

    /// Refills until at least `n` bytes are visible or the stream ends,
    /// then returns the window.
    pub fn ensure(&mut self, n: usize) -> Result<&[u8], Error> {
        while self.valid_end - self.cursor < n {
            if self.refill()? == 0 {
                break;
            }
        }
        Ok(&self.buf[self.cursor..self.valid_end])
    }

    /// Slides the retained region (`keep_before` bytes before the cursor
    /// plus everything unconsumed) to the buffer start and reads up to one
    /// chunk after it. Returns the number of new bytes; zero with an empty
    /// window is the normal end-of-stream condition.
    pub fn refill(&mut self) -> Result<usize, Error> {
        let keep_start = self.cursor.saturating_sub(self.keep_before);
        if keep_start > 0 {
            self.buf.copy_within(keep_start..self.valid_end, 0);
            self.cursor -= keep_start;
            self.valid_end -= keep_start;
        }

        let room = self.buf.len() - self.valid_end;
        let want = self.chunk.min(room);
        if want == 0 {
            return Ok(0);
        }

        let dst = &mut self.buf[self.valid_end..self.valid_end + want];
        let n = loop {
            match self.inner.read(dst) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.valid_end += n;
        Ok(n)
    }

    /// The caller moved the underlying stream behind our back; drop the
    /// buffered window so the next refill reads from the new position.
    pub fn note_seek(&mut self) {
        self.cursor = 0;
        self.valid_end = 0;
    }

    pub fn stream_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod test {
    use std::io::{Cursor, Seek, SeekFrom};

    use super::*;

    fn cursor_over(data: &[u8], chunk: usize) -> ByteCursor<Cursor<Vec<u8>>> {
        ByteCursor::new(Cursor::new(data.to_vec()), chunk, 8)
    }

    #[test]
    fn reads_all_bytes_across_refills() {
        let mut c = cursor_over(b"hello world", 3);
        let mut seen = Vec::new();
        while let Some(b) = c.next().unwrap() {
            seen.push(b);
        }
        assert_eq!(b"hello world".to_vec(), seen);
        assert_eq!(11, c.consumed_total());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut c = cursor_over(b"ab", 8);
        assert_eq!(Some(b'a'), c.peek().unwrap());
        assert_eq!(Some(b'a'), c.peek().unwrap());
        assert_eq!(Some(b'a'), c.next().unwrap());
        assert_eq!(Some(b'b'), c.next().unwrap());
        assert_eq!(None, c.peek().unwrap());
    }

    #[test]
    fn push_back_at_buffer_start_is_an_error() {
        let mut c = cursor_over(b"x", 8);
        match c.push_back() {
            Err(Error::PushBackOverflow) => (),
            r => panic!("unexpected result: {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn push_back_returns_last_byte() {
        let mut c = cursor_over(b"xy", 8);
        assert_eq!(Some(b'x'), c.next().unwrap());
        c.push_back().unwrap();
        assert_eq!(Some(b'x'), c.next().unwrap());
        assert_eq!(Some(b'y'), c.next().unwrap());
        assert_eq!(2, c.consumed_total());
    }

    #[test]
    fn refill_retains_bytes_before_cursor() {
        let mut c = cursor_over(b"abcdefghij", 4);
        c.set_keep_before(2);
        for _ in 0..4 {
            c.next().unwrap();
        }
        // Force a refill; the two bytes before the cursor must survive so
        // that push_back remains legal.
        c.ensure(1).unwrap();
        c.push_back().unwrap();
        c.push_back().unwrap();
        assert_eq!(Some(b'c'), c.next().unwrap());
    }

    #[test]
    fn per_call_counter_resets() {
        let mut c = cursor_over(b"abcd", 8);
        c.begin_call();
        c.next().unwrap();
        c.next().unwrap();
        assert_eq!(2, c.consumed_this_call());
        c.begin_call();
        c.next().unwrap();
        assert_eq!(1, c.consumed_this_call());
        assert_eq!(3, c.consumed_total());
    }

    #[test]
    fn note_seek_resynchronizes() {
        let mut c = cursor_over(b"abcdefgh", 4);
        c.next().unwrap();
        c.stream_mut().seek(SeekFrom::Start(6)).unwrap();
        c.note_seek();
        assert_eq!(Some(b'g'), c.next().unwrap());
    }
}
