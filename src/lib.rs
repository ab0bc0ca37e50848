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

//! Postbag provides the two low-level cores of an MH-style personal mail
//! toolkit: an incremental parser for RFC 5322 messages embedded in
//! concatenated maildrop files (mbox and MMDF framing), and an SMTP client
//! protocol state machine over an abstract transport.
//!
//! Everything else an MH-like suite needs (folder and sequence bookkeeping,
//! profile files, MIME composition, the CLI front ends) sits above these
//! modules and is out of scope here.

pub mod maildrop;
pub mod smtp;
pub mod support;

pub use crate::support::error::Error;
