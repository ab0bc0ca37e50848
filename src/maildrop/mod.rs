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

//! Incremental parsing of RFC 5322 messages, including messages embedded in
//! concatenated maildrop files.
//!
//! The parser is a pull tokenizer: each call to
//! [`MaildropParser::next_token`] yields one header field (or a continuation
//! chunk of a long field value), one chunk of body, or an end-of-file
//! marker, copying value/body bytes into a caller-provided buffer. Between
//! two messages of the same maildrop the caller must call
//! [`MaildropParser::reset`]; the parser never advances past a message
//! boundary on its own.
//!
//! Maildrop framing (mbox `From ` lines or MMDF control-character blocks) is
//! sniffed from the first bytes of the stream when the parser is created
//! with [`MaildropParser::new_maildrop`].

mod cursor;
mod delimiter;
mod scan;

pub use self::delimiter::{MaildropStyle, DEFAULT_MMDF_DELIMITER};
pub use self::scan::{MaildropConfig, MaildropParser, ScanState, Token, NAMESZ};
