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

use crate::support::error::Error;

/// How messages are framed in the stream being parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaildropStyle {
    /// The stream holds exactly one message; no delimiter scanning.
    Single,
    /// A maildrop whose framing has not been sniffed yet.
    Unknown,
    /// Messages separated by a `From ` line (classic UNIX mbox).
    Mbox,
    /// Messages bracketed by a fixed control-character sequence.
    Mmdf,
}

/// The mbox message separator, matched as `\n` + `From `.
pub(super) const MBOX_DELIMITER: &[u8] = b"From ";

/// The default MMDF delimiter line (CTRL-A block terminator).
pub const DEFAULT_MMDF_DELIMITER: &[u8] = b"\x01\x01\x01\x01\n";

/// End-anchored matcher for a message delimiter.
///
/// The match pattern is the delimiter preceded by the newline that
/// terminates the last content line; that newline belongs to the delimiter,
/// not to the message. The stored form keeps a NUL guard byte on either end
/// of the pattern, following the historical layout.
pub(super) struct DelimiterMatcher {
    /// NUL + `\n` + delimiter + NUL.
    full: Vec<u8>,
    style: MaildropStyle,
    /// Byte value to its last occurrence among the pattern's interior
    /// bytes. The pattern's first byte is the required preceding newline
    /// and a match ending at its last byte would already have been found
    /// in-window, so neither is mapped. Zero means "absent".
    last_pos: [u8; 256],
}

impl DelimiterMatcher {
    pub fn new(delimiter: &[u8], style: MaildropStyle) -> Result<Self, Error> {
        // A length-1-or-0 delimiter cannot be distinguished from an
        // accidental byte.
        if delimiter.len() < 2 {
            return Err(Error::DelimiterTooShort);
        }
        debug_assert!(delimiter.len() < 250);

        let mut full = Vec::with_capacity(delimiter.len() + 3);
        full.push(0);
        full.push(b'\n');
        full.extend_from_slice(delimiter);
        full.push(0);

        let mut last_pos = [0u8; 256];
        let pattern_len = delimiter.len() + 1;
        for i in 1..pattern_len - 1 {
            last_pos[full[1 + i] as usize] = i as u8;
        }

        Ok(DelimiterMatcher {
            full,
            style,
            last_pos,
        })
    }

    pub fn is_mbox(&self) -> bool {
        MaildropStyle::Mbox == self.style
    }

    /// The full match pattern: `\n` + delimiter.
    pub fn pattern(&self) -> &[u8] {
        &self.full[1..self.full.len() - 1]
    }

    pub fn pattern_len(&self) -> usize {
        self.full.len() - 2
    }

    /// The delimiter's first distinguishing byte (the one after the
    /// newline). The end-of-message test only runs when this byte is seen.
    pub fn lead(&self) -> u8 {
        self.full[2]
    }

    /// The bytes the end-of-message test compares once the newline and the
    /// lead byte have both matched.
    pub fn suffix(&self) -> &[u8] {
        &self.full[3..self.full.len() - 1]
    }

    /// Earliest offset in `tail` from which a pattern match could begin and
    /// run past the end of `tail`, or `None` if no match can straddle the
    /// boundary. `tail` is at most `pattern_len() - 1` bytes.
    pub fn partial_match_start(&self, tail: &[u8]) -> Option<usize> {
        let last = *tail.last()?;
        let pattern = self.pattern();
        // Boyer-Moore-style suppression: unless the final byte occurs in
        // the pattern's interior (or is the leading newline itself), no
        // partial match can end here.
        if 0 == self.last_pos[last as usize] && last != pattern[0] {
            return None;
        }

        let start_min = tail.len().saturating_sub(pattern.len() - 1);
        for start in start_min..tail.len() {
            let frag = &tail[start..];
            if frag == &pattern[..frag.len()] {
                return Some(start);
            }
        }
        None
    }
}
