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
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::reply::{self, Category, Outcome};
use super::transport::{PipeTransport, SaslClient, TcpTransport, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// Never negotiate TLS even if advertised.
    Disabled,
    /// Negotiate TLS when the server advertises STARTTLS.
    Opportunistic,
    /// Fail the session if the server does not advertise STARTTLS.
    Required,
}

impl Default for TlsMode {
    fn default() -> Self {
        TlsMode::Disabled
    }
}

/// Per-command reply timeouts, in seconds. The values are tuned protocol
/// constants, kept distinct per command on purpose; the final-dot timeout
/// additionally scales with the accepted-recipient count because servers
/// may fan delivery out synchronously before replying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    pub open: u64,
    pub helo: u64,
    pub rset: u64,
    pub mail: u64,
    pub rcpt: u64,
    pub data: u64,
    pub dot_base: u64,
    pub quit: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        SmtpTimeouts {
            open: 300,
            helo: 20,
            rset: 15,
            mail: 301,
            rcpt: 302,
            data: 120,
            dot_base: 600,
            quit: 30,
        }
    }
}

impl SmtpTimeouts {
    pub fn dot(&self, recipients: u32) -> Duration {
        Duration::from_secs(self.dot_base + 3 * u64::from(recipients))
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// Session-level options.
///
/// Credentials are deliberately absent: authenticated submission passes a
/// [`SaslClient`] to [`SmtpSession::open`], and that implementation owns
/// the username, password, or token material for its mechanism.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SmtpOptions {
    /// Echo the protocol transcript at `info` level instead of `debug`.
    pub watch: bool,
    pub verbose: bool,
    /// Log body-chunk accounting while in DATA.
    pub debug: bool,
    /// Refuse to proceed without successful SASL authentication.
    pub require_sasl: bool,
    /// Mechanism to use; when absent the server's first offer is taken.
    pub sasl_mechanism: Option<String>,
    pub tls: TlsMode,
    pub timeouts: SmtpTimeouts,
}

/// How to end a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    /// QUIT and tear the transport down.
    Clean,
    /// RSET and QUIT, but report the reply that was current before the
    /// teardown started; used after a failure so the caller can still see
    /// what actually went wrong.
    AbortPreserveError,
    /// RSET only, leaving the session open for another message. Succeeds
    /// only if the server accepted the RSET with 250.
    ResetForReuse,
}

/// One SMTP client session over an abstract transport.
///
/// Capability state, the last structured reply, and the accepted-recipient
/// count are all per-session fields; nothing here is process-global.
pub struct SmtpSession {
    transport: Box<dyn Transport>,
    options: SmtpOptions,
    capabilities: Vec<String>,
    sasl_mechanisms: Vec<String>,
    collect_next_reply: bool,
    last_reply: Outcome,
    recipients: u32,
    data_open: bool,
    at_line_start: bool,
    data_prev: u8,
}

impl SmtpSession {
    /// Opens a session over an already-connected transport: reads the
    /// banner, greets, negotiates TLS per the options, and authenticates
    /// when an authenticator is supplied. On failure the transport is torn
    /// down and the classified reply is returned.
    pub fn open(
        transport: Box<dyn Transport>,
        client_name: &str,
        options: SmtpOptions,
        sasl: Option<&mut dyn SaslClient>,
    ) -> Result<Self, Outcome> {
        let mut session = SmtpSession {
            transport,
            options,
            capabilities: Vec::new(),
            sasl_mechanisms: Vec::new(),
            collect_next_reply: false,
            last_reply: Outcome::local(Category::Ok, ""),
            recipients: 0,
            data_open: false,
            at_line_start: true,
            data_prev: 0,
        };
        match session.handshake(client_name, sasl) {
            Ok(()) => Ok(session),
            Err(outcome) => {
                session.transport.abort();
                Err(outcome)
            },
        }
    }

    /// Opens a session against `server:port` over plain TCP.
    pub fn open_tcp(
        server: &str,
        port: u16,
        client_name: &str,
        options: SmtpOptions,
        sasl: Option<&mut dyn SaslClient>,
    ) -> Result<Self, Outcome> {
        let transport = TcpTransport::connect(server, port, secs(options.timeouts.open))
            .map_err(|e| {
                error!("cannot connect to {}:{}: {}", server, port, e);
                Outcome::local(
                    Category::TransientHostError,
                    format!("cannot connect to {}: {}", server, e),
                )
            })?;
        Self::open(Box::new(transport), client_name, options, sasl)
    }

    /// Opens a session against a locally spawned MTA speaking SMTP on its
    /// stdio, e.g. `sendmail -bs`.
    pub fn open_program(
        argv: &[&str],
        client_name: &str,
        options: SmtpOptions,
    ) -> Result<Self, Outcome> {
        let transport = PipeTransport::spawn(argv).map_err(|e| {
            error!("cannot start local MTA: {}", e);
            Outcome::local(
                Category::TransientHostError,
                format!("cannot start local MTA: {}", e),
            )
        })?;
        Self::open(Box::new(transport), client_name, options, None)
    }

    fn handshake(
        &mut self,
        client_name: &str,
        sasl: Option<&mut dyn SaslClient>,
    ) -> Result<(), Outcome> {
        let (code, text) = self.read_reply(secs(self.options.timeouts.open))?;
        if 220 != code {
            return Err(self.outcome(Category::TransientHostError, code, text));
        }

        self.hello(client_name)?;
        self.negotiate_tls(client_name)?;

        match sasl {
            Some(sasl) => self.authenticate(sasl),
            None if self.options.require_sasl => Err(self.local_outcome(
                Category::TransientHostError,
                "SASL required but no authenticator was supplied".to_owned(),
            )),
            None => Ok(()),
        }
    }

    /// EHLO, falling back to HELO when the server rejects EHLO with a
    /// permanent code. Capability and mechanism lists are rebuilt from
    /// scratch on each invocation.
    fn hello(&mut self, client_name: &str) -> Result<(), Outcome> {
        self.collect_next_reply = true;
        let (code, text) =
            self.exchange(&format!("EHLO {}", client_name), secs(self.options.timeouts.helo))?;
        if 250 == code {
            self.outcome(Category::Ok, code, text);
            return Ok(());
        }

        if (500..600).contains(&code) {
            self.collect_next_reply = true;
            let (code, text) = self
                .exchange(&format!("HELO {}", client_name), secs(self.options.timeouts.helo))?;
            if 250 == code {
                self.outcome(Category::Ok, code, text);
                return Ok(());
            }
            return Err(self.outcome(generic_category(code), code, text));
        }

        Err(self.outcome(Category::TransientHostError, code, text))
    }

    fn negotiate_tls(&mut self, client_name: &str) -> Result<(), Outcome> {
        let advertised = self.has_capability("STARTTLS");
        match self.options.tls {
            TlsMode::Disabled => return Ok(()),
            TlsMode::Opportunistic if !advertised => return Ok(()),
            TlsMode::Required if !advertised => {
                return Err(self.local_outcome(
                    Category::TransientHostError,
                    "TLS required but the server does not advertise STARTTLS"
                        .to_owned(),
                ))
            },
            TlsMode::Opportunistic | TlsMode::Required => (),
        }

        let (code, text) =
            self.exchange("STARTTLS", secs(self.options.timeouts.helo))?;
        if 220 != code {
            return Err(self.outcome(generic_category(code), code, text));
        }
        if let Err(e) = self.transport.start_tls() {
            return Err(self.local_outcome(
                Category::TransientHostError,
                format!("TLS negotiation failed: {}", e),
            ));
        }

        // Anything the server claimed before the upgrade is untrustworthy.
        self.hello(client_name)
    }

    fn authenticate(&mut self, sasl: &mut dyn SaslClient) -> Result<(), Outcome> {
        let mechanism = match &self.options.sasl_mechanism {
            Some(m) => m.clone(),
            None => match self.sasl_mechanisms.first() {
                Some(m) => m.clone(),
                None => {
                    return Err(self.local_outcome(
                        Category::TransientHostError,
                        "SASL requested but the server offers no mechanisms"
                            .to_owned(),
                    ))
                },
            },
        };
        if !self
            .sasl_mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&mechanism))
        {
            return Err(self.local_outcome(
                Category::TransientHostError,
                format!("server does not offer SASL mechanism {}", mechanism),
            ));
        }

        let initial = match sasl.on_start() {
            Ok(initial) => initial,
            Err(e) => {
                return Err(self.local_outcome(
                    Category::TransientHostError,
                    format!("SASL initialization failed: {}", e),
                ))
            },
        };
        let mut line = format!("AUTH {}", mechanism);
        match initial {
            // RFC 4954 spells an empty initial response "=".
            Some(ref initial) if initial.is_empty() => line.push_str(" ="),
            Some(ref initial) => {
                line.push(' ');
                line.push_str(&base64::encode(initial));
            },
            None => (),
        }
        self.send_line(&line, secs(self.options.timeouts.helo))?;

        loop {
            let (code, text) =
                self.read_reply(secs(self.options.timeouts.helo))?;
            match code {
                334 => {
                    let challenge = match base64::decode(text.trim()) {
                        Ok(challenge) => challenge,
                        Err(_) => {
                            return self.cancel_auth(
                                sasl,
                                "server sent an undecodable SASL challenge",
                            )
                        },
                    };
                    let response = sasl
                        .on_read(&challenge)
                        .and_then(|_| sasl.on_write());
                    match response {
                        Ok(response) => self.send_line(
                            &base64::encode(&response),
                            secs(self.options.timeouts.helo),
                        )?,
                        Err(e) => {
                            warn!("SASL exchange failed: {}", e);
                            return self
                                .cancel_auth(sasl, "SASL exchange failed");
                        },
                    }
                },
                235 => {
                    if let Err(e) = sasl.on_finish() {
                        return Err(self.local_outcome(
                            Category::TransientHostError,
                            format!("SASL completion failed: {}", e),
                        ));
                    }
                    self.outcome(Category::Ok, code, text);
                    return Ok(());
                },
                _ => {
                    let category = match code {
                        400..=499 => Category::TransientRetry,
                        502 => Category::UnsupportedCommand,
                        500..=599 => Category::UserError,
                        _ => Category::GenericReplyError,
                    };
                    return Err(self.outcome(category, code, text));
                },
            }
        }
    }

    /// Sends the RFC 4954 "*" abort, lets the server reply, and reports the
    /// failure.
    fn cancel_auth(
        &mut self,
        sasl: &mut dyn SaslClient,
        why: &str,
    ) -> Result<(), Outcome> {
        sasl.on_cancel();
        let _ = self.send_line("*", secs(self.options.timeouts.helo));
        let _ = self.read_reply(secs(self.options.timeouts.helo));
        Err(self.local_outcome(Category::TransientHostError, why.to_owned()))
    }

    /// Starts a mail transaction. `smtp_utf8` without the server-side
    /// capability is refused outright rather than silently mangling
    /// non-ASCII addresses.
    pub fn begin_message(
        &mut self,
        from: &str,
        smtp_utf8: bool,
        eight_bit: bool,
    ) -> Outcome {
        if smtp_utf8 && !self.has_capability("SMTPUTF8") {
            return self.local_outcome(
                Category::TransientHostError,
                "message needs SMTPUTF8, which the server does not advertise"
                    .to_owned(),
            );
        }

        let mut line = format!("MAIL FROM:<{}>", from);
        if eight_bit && self.has_capability("8BITMIME") {
            line.push_str(" BODY=8BITMIME");
        }
        if smtp_utf8 {
            line.push_str(" SMTPUTF8");
        }

        self.recipients = 0;
        match self.exchange(&line, secs(self.options.timeouts.mail)) {
            Err(outcome) => outcome,
            Ok((code, text)) => {
                let category = match code {
                    250 => Category::Ok,
                    500 | 501 | 552 => Category::ParameterError,
                    _ => generic_category(code),
                };
                self.outcome(category, code, text)
            },
        }
    }

    /// Offers one recipient. Failures are per-recipient; the caller loops
    /// over its list and collects each outcome independently.
    pub fn add_recipient(
        &mut self,
        mailbox: &str,
        host: Option<&str>,
        route: Option<&str>,
    ) -> Outcome {
        let mut addr = String::from("<");
        if let Some(route) = route {
            addr.push_str(route);
        }
        addr.push_str(mailbox);
        if let Some(host) = host {
            addr.push('@');
            addr.push_str(host);
        }
        addr.push('>');

        match self.exchange(
            &format!("RCPT TO:{}", addr),
            secs(self.options.timeouts.rcpt),
        ) {
            Err(outcome) => outcome,
            Ok((code, text)) => {
                let category = match code {
                    250 | 251 => {
                        self.recipients += 1;
                        Category::AddressAccepted
                    },
                    421 | 450 | 452 => Category::TransientRetry,
                    500 | 501 => Category::ParameterError,
                    550 | 551 | 552 | 553 => Category::UserError,
                    _ => generic_category(code),
                };
                self.outcome(category, code, text)
            },
        }
    }

    pub fn begin_data(&mut self) -> Outcome {
        match self.exchange("DATA", secs(self.options.timeouts.data)) {
            Err(outcome) => outcome,
            Ok((354, text)) => {
                self.data_open = true;
                self.at_line_start = true;
                self.data_prev = 0;
                self.outcome(Category::Ok, 354, text)
            },
            Ok((code, text)) => {
                let category = match code {
                    421 | 451 => Category::TransientRetry,
                    500 | 501 | 503 | 554 => Category::NotDelivered,
                    _ => generic_category(code),
                };
                self.outcome(category, code, text)
            },
        }
    }

    /// Streams part of the message body, canonicalizing line endings to
    /// CRLF and dot-stuffing. Chunk boundaries may fall anywhere; the
    /// line-start state is carried across calls.
    pub fn write_body_chunk(&mut self, bytes: &[u8]) -> Outcome {
        if !self.data_open {
            return self.local_outcome(
                Category::GenericReplyError,
                "write_body_chunk outside a DATA phase".to_owned(),
            );
        }

        let mut wire = Vec::with_capacity(bytes.len() + bytes.len() / 8 + 2);
        canonicalize_into(
            &mut wire,
            bytes,
            &mut self.at_line_start,
            &mut self.data_prev,
        );
        if self.options.debug {
            debug!(
                "body chunk: {} bytes in, {} on the wire",
                bytes.len(),
                wire.len()
            );
        }
        match self
            .transport
            .write_all(&wire, secs(self.options.timeouts.data))
        {
            Ok(()) => self.local_outcome(Category::Ok, String::new()),
            Err(e) => self.connection_lost(&e),
        }
    }

    /// Sends the terminating dot and waits for the verdict. The reply
    /// timeout grows with the number of accepted recipients.
    pub fn end_data(&mut self) -> Outcome {
        if !self.data_open {
            return self.local_outcome(
                Category::GenericReplyError,
                "end_data outside a DATA phase".to_owned(),
            );
        }
        self.data_open = false;

        let mut tail = Vec::new();
        if !self.at_line_start {
            tail.extend_from_slice(b"\r\n");
        }
        tail.extend_from_slice(b".\r\n");

        let timeout = self.options.timeouts.dot(self.recipients);
        if let Err(e) = self
            .transport
            .write_all(&tail, timeout)
            .and_then(|_| self.transport.flush())
        {
            return self.connection_lost(&e);
        }
        self.transcript('>', ".");

        match self.read_reply(timeout) {
            Err(outcome) => outcome,
            Ok((code, text)) => {
                let category = match code {
                    250 => Category::MessageAccepted,
                    421 | 451 | 452 => Category::TransientRetry,
                    _ if code >= 500 => Category::NotDelivered,
                    _ => generic_category(code),
                };
                self.outcome(category, code, text)
            },
        }
    }

    pub fn close(&mut self, mode: CloseMode) -> Outcome {
        match mode {
            CloseMode::Clean => {
                let result = match self
                    .exchange("QUIT", secs(self.options.timeouts.quit))
                {
                    Err(outcome) => outcome,
                    Ok((code, text)) => {
                        let category = match code {
                            221 | 250 => Category::Ok,
                            _ => generic_category(code),
                        };
                        self.outcome(category, code, text)
                    },
                };
                self.transport.close();
                result
            },

            CloseMode::AbortPreserveError => {
                let preserved = self.last_reply.clone();
                // Best effort only; the server may already be gone, and the
                // RSET/QUIT replies must not displace the failure we are
                // aborting over.
                let _ = self.exchange("RSET", secs(self.options.timeouts.rset));
                let _ = self.exchange("QUIT", secs(self.options.timeouts.quit));
                self.transport.abort();
                self.last_reply = preserved.clone();
                preserved
            },

            CloseMode::ResetForReuse => {
                match self.exchange("RSET", secs(self.options.timeouts.rset)) {
                    Err(outcome) => outcome,
                    Ok((250, text)) => self.outcome(Category::Ok, 250, text),
                    Ok((code, text)) => {
                        self.outcome(generic_category(code), code, text)
                    },
                }
            },
        }
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn sasl_mechanisms(&self) -> &[String] {
        &self.sasl_mechanisms
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| {
            c.split_ascii_whitespace()
                .next()
                .map_or(false, |k| k.eq_ignore_ascii_case(name))
        })
    }

    pub fn last_reply(&self) -> &Outcome {
        &self.last_reply
    }

    pub fn accepted_recipients(&self) -> u32 {
        self.recipients
    }

    fn exchange(
        &mut self,
        line: &str,
        timeout: Duration,
    ) -> Result<(u16, String), Outcome> {
        self.send_line(line, timeout)?;
        self.read_reply(timeout)
    }

    fn send_line(
        &mut self,
        line: &str,
        timeout: Duration,
    ) -> Result<(), Outcome> {
        self.transcript('>', line);
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        match self
            .transport
            .write_all(&data, timeout)
            .and_then(|_| self.transport.flush())
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.connection_lost(&e)),
        }
    }

    /// Reads one complete (possibly multi-line) reply. Returns the code and
    /// the accumulated text; transport failures come back as an already
    /// classified connection error.
    fn read_reply(
        &mut self,
        timeout: Duration,
    ) -> Result<(u16, String), Outcome> {
        let collecting = std::mem::replace(&mut self.collect_next_reply, false);
        if collecting {
            self.capabilities.clear();
            self.sasl_mechanisms.clear();
        }

        let mut code: Option<u16> = None;
        let mut text = String::new();
        loop {
            let line = match self.transport.read_line(timeout) {
                Ok(line) => line,
                Err(e) => return Err(self.connection_lost(&e)),
            };
            self.transcript('<', &String::from_utf8_lossy(&line));

            let parsed = match reply::parse_line(&line) {
                Some(parsed) => parsed,
                None => {
                    warn!(
                        "ignoring malformed reply line {:?}",
                        String::from_utf8_lossy(&line)
                    );
                    continue;
                },
            };

            if parsed.code < 100 {
                // Not RFC 5321, but preserved as an extension point: show
                // the interstitial and wait for a real reply.
                info!(
                    "server interjects: {}",
                    String::from_utf8_lossy(parsed.text)
                );
                continue;
            }

            match code {
                None => {
                    code = Some(parsed.code);
                    reply::append_text(&mut text, parsed.text);
                },
                Some(expected) if parsed.code == expected => {
                    // The first line of an EHLO reply is the greeting; only
                    // the lines after it carry capabilities.
                    if collecting && 250 == expected {
                        self.collect_capability(parsed.text);
                    }
                    reply::append_text(&mut text, parsed.text);
                },
                Some(expected) => {
                    warn!(
                        "ignoring reply line with code {} inside a {} reply",
                        parsed.code, expected
                    );
                    continue;
                },
            }

            if parsed.last {
                return Ok((parsed.code, text));
            }
        }
    }

    fn collect_capability(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let mut words = line.split_ascii_whitespace();
        let key = match words.next() {
            Some(key) => key,
            None => return,
        };

        if key.eq_ignore_ascii_case("AUTH") {
            for mechanism in words {
                if self.sasl_mechanisms.len() >= reply::MAX_CAPABILITIES {
                    break;
                }
                self.sasl_mechanisms.push(mechanism.to_owned());
            }
        } else if self.capabilities.len() < reply::MAX_CAPABILITIES {
            self.capabilities.push(line.trim().to_owned());
        }
    }

    fn outcome(&mut self, category: Category, code: u16, text: String) -> Outcome {
        let outcome = Outcome::reply(category, code, text);
        if self.options.verbose {
            info!("{}", outcome);
        }
        self.last_reply = outcome.clone();
        outcome
    }

    fn local_outcome(&mut self, category: Category, text: String) -> Outcome {
        let outcome = Outcome::local(category, text);
        if self.options.verbose {
            info!("{}", outcome);
        }
        self.last_reply = outcome.clone();
        outcome
    }

    fn connection_lost(&mut self, e: &io::Error) -> Outcome {
        let text = match self.transport.last_error() {
            Some(detail) if detail != e.to_string() => {
                format!("connection failed: {} ({})", e, detail)
            },
            _ => format!("connection failed: {}", e),
        };
        error!("{}", text);
        self.local_outcome(Category::TransientHostError, text)
    }

    fn transcript(&self, direction: char, line: &str) {
        if self.options.watch {
            info!("{} {}", direction, line);
        } else {
            debug!("{} {}", direction, line);
        }
    }
}

fn generic_category(code: u16) -> Category {
    if 502 == code {
        Category::UnsupportedCommand
    } else {
        Category::GenericReplyError
    }
}

/// Rewrites `bytes` for the DATA phase: bare `\n` becomes `\r\n` and a line
/// beginning with `.` gets a second leading `.`. The two flags carry the
/// line-start and previous-byte state between chunks.
fn canonicalize_into(
    wire: &mut Vec<u8>,
    bytes: &[u8],
    at_line_start: &mut bool,
    prev: &mut u8,
) {
    for &b in bytes {
        if *at_line_start && b == b'.' {
            wire.push(b'.');
        }
        if b == b'\n' && *prev != b'\r' {
            wire.push(b'\r');
        }
        wire.push(b);
        *at_line_start = b == b'\n';
        *prev = b;
    }
}
