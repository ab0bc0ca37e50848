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

//! SMTP client protocol state machine.
//!
//! The session speaks RFC 5321 over an abstract [`Transport`], which may be
//! a TCP connection or the stdio pipes of a locally spawned MTA. Every
//! server reply is folded into the closed [`Category`] set; raw reply codes
//! never leak to callers, though the server's own text always survives in
//! the [`Outcome`].

mod reply;
mod session;
mod transport;

pub use self::reply::{Category, Outcome};
pub use self::session::{
    CloseMode, SmtpOptions, SmtpSession, SmtpTimeouts, TlsMode,
};
pub use self::transport::{PipeTransport, SaslClient, TcpTransport, Transport};
