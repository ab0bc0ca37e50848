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

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use crate::support::error::Error;

/// The wire a session talks over.
///
/// Implementations are line-oriented on the read side; `read_line` returns
/// one line without its trailing `\n` (a trailing `\r` is left in place for
/// the reply parser to strip). Reaching end-of-stream with no buffered data
/// is reported as `UnexpectedEof`.
pub trait Transport {
    fn read_line(&mut self, timeout: Duration) -> io::Result<Vec<u8>>;
    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    /// Upgrades the connection to TLS in place.
    fn start_tls(&mut self) -> Result<(), Error>;
    /// Orderly teardown after QUIT.
    fn close(&mut self);
    /// Hard teardown; implementations with a child process kill it here.
    fn abort(&mut self) {
        self.close();
    }
    /// Text of the most recent transport-level failure, for embedding in a
    /// connection-error reply.
    fn last_error(&self) -> Option<String>;
}

/// Client side of a SASL exchange. The session owns the wire framing
/// (RFC 4954 base64 lines); implementations see only decoded bytes.
pub trait SaslClient {
    /// Begins the exchange, optionally producing an initial response to
    /// send with the AUTH command itself.
    fn on_start(&mut self) -> Result<Option<Vec<u8>>, Error>;
    /// Receives one decoded server challenge.
    fn on_read(&mut self, challenge: &[u8]) -> Result<(), Error>;
    /// Produces the response to the last challenge.
    fn on_write(&mut self) -> Result<Vec<u8>, Error>;
    /// The server reported success; finalize.
    fn on_finish(&mut self) -> Result<(), Error>;
    /// The exchange is being abandoned.
    fn on_cancel(&mut self);
}

/// Plain TCP transport. `start_tls` is unsupported; a TLS-capable transport
/// is expected to come from the caller's network stack.
pub struct TcpTransport {
    stream: TcpStream,
    buf: Vec<u8>,
    last_error: Option<String>,
}

impl TcpTransport {
    pub fn connect(
        server: &str,
        port: u16,
        timeout: Duration,
    ) -> io::Result<Self> {
        let mut last = None;
        for addr in (server, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    return Ok(TcpTransport {
                        stream,
                        buf: Vec::new(),
                        last_error: None,
                    })
                },
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", server),
            )
        }))
    }

    fn note<T>(&mut self, r: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &r {
            self.last_error = Some(e.to_string());
        }
        r
    }
}

impl Transport for TcpTransport {
    fn read_line(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.buf) {
                let mut line: Vec<u8> = self.buf.drain(..=i).collect();
                line.pop();
                return Ok(line);
            }

            let r = self.stream.set_read_timeout(Some(timeout));
            self.note(r)?;
            let mut chunk = [0u8; 1024];
            let n = loop {
                match self.stream.read(&mut chunk) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        continue
                    },
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        let e = io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out waiting for server reply",
                        );
                        let r: io::Result<usize> = Err(e);
                        return self.note(r).map(|_| Vec::new());
                    },
                    Err(e) => {
                        let r: io::Result<usize> = Err(e);
                        return self.note(r).map(|_| Vec::new());
                    },
                }
            };
            if 0 == n {
                if self.buf.is_empty() {
                    let r: io::Result<usize> = Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    ));
                    return self.note(r).map(|_| Vec::new());
                }
                return Ok(std::mem::replace(&mut self.buf, Vec::new()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn write_all(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let r = self.stream.set_write_timeout(Some(timeout));
        self.note(r)?;
        let r = self.stream.write_all(data);
        self.note(r)
    }

    fn flush(&mut self) -> io::Result<()> {
        let r = self.stream.flush();
        self.note(r)
    }

    fn start_tls(&mut self) -> Result<(), Error> {
        Err(Error::TlsUnsupported)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

/// Transport over the stdio pipes of a locally spawned MTA, e.g.
/// `sendmail -bs`. Read timeouts are enforced with `poll(2)`; writes go to
/// a pipe buffer and are not separately timed.
pub struct PipeTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    buf: Vec<u8>,
    last_error: Option<String>,
}

impl PipeTransport {
    pub fn spawn(argv: &[&str]) -> Result<Self, Error> {
        let (program, args) = match argv.split_first() {
            Some(parts) => parts,
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "empty MTA command line",
                )))
            },
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        // Both pipes were requested piped above, so both are present.
        let stdin = child.stdin.take();
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "child stdout not captured",
                )))
            },
        };
        Ok(PipeTransport {
            child,
            stdin,
            stdout,
            buf: Vec::new(),
            last_error: None,
        })
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<()> {
        use nix::poll::{poll, PollFd, PollFlags};

        let millis = timeout.as_millis().min(i32::max_value() as u128) as i32;
        let mut fds = [PollFd::new(self.stdout.as_raw_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, millis) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for local MTA reply",
                    ))
                },
                Ok(_) => return Ok(()),
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        e.to_string(),
                    ))
                },
            }
        }
    }

    fn note<T>(&mut self, r: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &r {
            self.last_error = Some(e.to_string());
        }
        r
    }
}

impl Transport for PipeTransport {
    fn read_line(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.buf) {
                let mut line: Vec<u8> = self.buf.drain(..=i).collect();
                line.pop();
                return Ok(line);
            }

            let r = self.wait_readable(timeout);
            self.note(r)?;
            let mut chunk = [0u8; 1024];
            let n = loop {
                match self.stdout.read(&mut chunk) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        continue
                    },
                    Err(e) => {
                        let r: io::Result<usize> = Err(e);
                        return self.note(r).map(|_| Vec::new());
                    },
                }
            };
            if 0 == n {
                if self.buf.is_empty() {
                    let r: io::Result<usize> = Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "local MTA closed its output",
                    ));
                    return self.note(r).map(|_| Vec::new());
                }
                return Ok(std::mem::replace(&mut self.buf, Vec::new()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn write_all(&mut self, data: &[u8], _timeout: Duration) -> io::Result<()> {
        let r = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(data),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "local MTA stdin already closed",
            )),
        };
        self.note(r)
    }

    fn flush(&mut self) -> io::Result<()> {
        let r = match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        };
        self.note(r)
    }

    fn start_tls(&mut self) -> Result<(), Error> {
        Err(Error::TlsUnsupported)
    }

    fn close(&mut self) {
        // Dropping stdin sends EOF; the child is then reaped so it never
        // lingers as a zombie.
        self.stdin = None;
        let _ = self.child.wait();
    }

    fn abort(&mut self) {
        use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};

        // Killing the child can tear the pipe down under us; a SIGPIPE
        // delivered mid-teardown would kill this process too.
        let mut sigpipe = SigSet::empty();
        sigpipe.add(Signal::SIGPIPE);
        let mut saved = SigSet::empty();
        let blocked =
            sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sigpipe), Some(&mut saved))
                .is_ok();

        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();

        if blocked {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&saved), None);
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pipe_transport_round_trip() {
        // `cat` echoes our writes back, which is enough to exercise the
        // poll-based line reader and the teardown paths.
        let mut t = PipeTransport::spawn(&["cat"]).unwrap();
        t.write_all(b"220 hello\r\n250 ok\r\n", Duration::from_secs(5))
            .unwrap();
        t.flush().unwrap();
        assert_eq!(b"220 hello\r".to_vec(), t.read_line(Duration::from_secs(5)).unwrap());
        assert_eq!(b"250 ok\r".to_vec(), t.read_line(Duration::from_secs(5)).unwrap());
        t.close();
    }

    #[test]
    fn pipe_transport_read_times_out() {
        let mut t = PipeTransport::spawn(&["cat"]).unwrap();
        match t.read_line(Duration::from_millis(50)) {
            Err(e) => assert_eq!(io::ErrorKind::TimedOut, e.kind()),
            Ok(l) => panic!("unexpected line: {:?}", l),
        }
        assert!(t.last_error().is_some());
        t.abort();
    }

    #[test]
    fn empty_command_line_is_rejected() {
        match PipeTransport::spawn(&[]) {
            Err(Error::Io(e)) => {
                assert_eq!(io::ErrorKind::InvalidInput, e.kind())
            },
            r => panic!("unexpected result: {:?}", r.map(|_| ())),
        }
    }
}
