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

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hard bound on accumulated reply text. Multi-line replies that would
/// exceed it are truncated rather than ever overrunning.
pub(super) const MAX_REPLY_TEXT: usize = 8192;

/// Hard bound on capability strings collected from one EHLO response.
pub(super) const MAX_CAPABILITIES: usize = 20;

/// The closed set of session-level results. Callers dispatch on these;
/// the numeric reply code is informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    /// The command did what it should.
    Ok,
    /// The final dot was accepted; the message is queued or delivered.
    MessageAccepted,
    /// A recipient was accepted (including "will forward").
    AddressAccepted,
    /// The host or transport is unusable for this session.
    TransientHostError,
    /// A reply that fits no more specific category.
    GenericReplyError,
    /// The server rejected command parameters permanently.
    ParameterError,
    /// Worth retrying later.
    TransientRetry,
    /// The user/mailbox was rejected permanently.
    UserError,
    /// The message was refused at the DATA stage.
    NotDelivered,
    /// The server does not implement the command.
    UnsupportedCommand,
}

impl Category {
    pub fn is_success(self) -> bool {
        match self {
            Category::Ok | Category::MessageAccepted | Category::AddressAccepted => true,
            _ => false,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Category::Ok => "OK",
            Category::MessageAccepted => "MESSAGE ACCEPTED",
            Category::AddressAccepted => "ADDRESS ACCEPTED",
            Category::TransientHostError => "HOST ERROR",
            Category::GenericReplyError => "REPLY ERROR",
            Category::ParameterError => "PARAMETER ERROR",
            Category::TransientRetry => "TRY AGAIN",
            Category::UserError => "USER ERROR",
            Category::NotDelivered => "NOT DELIVERED",
            Category::UnsupportedCommand => "UNSUPPORTED COMMAND",
        }
    }
}

/// One classified server reply (or locally generated failure). The server's
/// original text is always preserved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub category: Category,
    /// Absent for failures generated on this side of the wire.
    pub code: Option<u16>,
    pub text: String,
}

impl Outcome {
    pub(super) fn reply(category: Category, code: u16, text: String) -> Self {
        Outcome {
            category,
            code: Some(code),
            text,
        }
    }

    pub(super) fn local(category: Category, text: impl Into<String>) -> Self {
        Outcome {
            category,
            code: None,
            text: text.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.category.is_success()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => {
                write!(f, "[{}] {} {}", self.category.label(), code, self.text)
            },
            None => write!(f, "[{}] {}", self.category.label(), self.text),
        }
    }
}

/// One line of a server reply, split into its parts.
pub(super) struct ParsedLine<'a> {
    pub code: u16,
    /// False when the code is followed by `-`, i.e. more lines follow.
    pub last: bool,
    pub text: &'a [u8],
}

/// Splits a raw reply line into code, continuation flag, and text. Returns
/// `None` for lines that do not start with three digits; the reader skips
/// those as garbage.
pub(super) fn parse_line(line: &[u8]) -> Option<ParsedLine<'_>> {
    let line = match line.split_last() {
        Some((&b'\r', head)) => head,
        _ => line,
    };
    if line.len() < 3 || !line[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }

    let code = (u16::from(line[0] - b'0') * 10 + u16::from(line[1] - b'0')) * 10
        + u16::from(line[2] - b'0');
    let (last, text) = match line.get(3) {
        None => (true, &line[3..]),
        Some(&b'-') => (false, &line[4..]),
        Some(_) => (true, &line[4..]),
    };
    Some(ParsedLine { code, last, text })
}

/// Appends one line's text to the accumulated reply, joining with `"; "`
/// and truncating at the bound.
pub(super) fn append_text(acc: &mut String, line: &[u8]) {
    if acc.len() >= MAX_REPLY_TEXT {
        return;
    }
    let mut piece = String::new();
    if !acc.is_empty() {
        piece.push_str("; ");
    }
    piece.push_str(&String::from_utf8_lossy(line));
    let room = MAX_REPLY_TEXT - acc.len();
    if piece.len() > room {
        // Truncation point must not split a UTF-8 sequence.
        let mut cut = room;
        while cut > 0 && !piece.is_char_boundary(cut) {
            cut -= 1;
        }
        piece.truncate(cut);
    }
    acc.push_str(&piece);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_final_and_continuation_lines() {
        let p = parse_line(b"250 mx.example.com ready\r").unwrap();
        assert_eq!(250, p.code);
        assert!(p.last);
        assert_eq!(b"mx.example.com ready", p.text);

        let p = parse_line(b"250-PIPELINING").unwrap();
        assert_eq!(250, p.code);
        assert!(!p.last);
        assert_eq!(b"PIPELINING", p.text);

        let p = parse_line(b"421").unwrap();
        assert_eq!(421, p.code);
        assert!(p.last);
        assert!(p.text.is_empty());
    }

    #[test]
    fn garbage_lines_are_rejected() {
        assert!(parse_line(b"").is_none());
        assert!(parse_line(b"ok").is_none());
        assert!(parse_line(b"25x whatever").is_none());
    }

    #[test]
    fn text_accumulation_joins_and_truncates() {
        let mut acc = String::new();
        append_text(&mut acc, b"first");
        append_text(&mut acc, b"second");
        assert_eq!("first; second", acc);

        let mut acc = String::new();
        let long = vec![b'x'; 3000];
        for _ in 0..4 {
            append_text(&mut acc, &long);
        }
        assert_eq!(MAX_REPLY_TEXT, acc.len());
        append_text(&mut acc, b"more");
        assert_eq!(MAX_REPLY_TEXT, acc.len());
    }

    #[test]
    fn display_includes_label_and_code() {
        let with_code =
            Outcome::reply(Category::UserError, 550, "no such user".to_owned());
        assert_eq!("[USER ERROR] 550 no such user", with_code.to_string());

        let local = Outcome::local(Category::TransientHostError, "connection lost");
        assert_eq!("[HOST ERROR] connection lost", local.to_string());
    }

    #[test]
    fn success_categories() {
        assert!(Category::Ok.is_success());
        assert!(Category::MessageAccepted.is_success());
        assert!(Category::AddressAccepted.is_success());
        assert!(!Category::TransientRetry.is_success());
        assert!(!Category::UnsupportedCommand.is_success());
    }
}
