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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A header field name (plus its colon) would not fit the 998-byte
    /// field limit.
    #[error("Header field name longer than {0} bytes")]
    NameTooLong(usize),
    /// A header line with no colon could not be handed back as body content
    /// because the caller's buffer is too small to hold it.
    #[error("Malformed header line does not fit the caller's buffer")]
    MalformedField,
    /// A maildrop delimiter of fewer than 2 bytes cannot be distinguished
    /// from an accidental byte.
    #[error("Maildrop delimiter must be at least 2 bytes")]
    DelimiterTooShort,
    /// `push_back` was called with the cursor already at the start of the
    /// scan buffer. This is a programming-contract violation in the caller.
    #[error("Nowhere to push back; scan buffer start reached")]
    PushBackOverflow,
    /// TLS upgrade was requested from a transport that cannot provide it.
    #[error("Transport does not support TLS upgrade")]
    TlsUnsupported,
    /// SASL negotiation failed locally (mechanism error, bad challenge).
    #[error("SASL negotiation failed: {0}")]
    Sasl(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
