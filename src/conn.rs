// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! The byte stream connecting us to the target VM.

Both attach flavors end up holding a plain blocking stream; they only
differ in how the stream gets created. The framing helpers are generic
over `Read`/`Write` so the protocol code can be exercised against
in-memory buffers.
*/

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    os::unix::net::UnixStream,
};

use crate::error::{AttachError, Result};

/// A connected attach endpoint. HotSpot talks over a unix domain
/// socket, OpenJ9 dials us back over tcp loopback.
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Connection {
    /// Closing is best effort; the session is done either way.
    pub fn shutdown(&self) {
        let _ = match self {
            Connection::Unix(s) => s.shutdown(Shutdown::Both),
            Connection::Tcp(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Unix(s) => s.read(buf),
            Connection::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Unix(s) => s.write(buf),
            Connection::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Unix(s) => s.flush(),
            Connection::Tcp(s) => s.flush(),
        }
    }
}

/// Write every byte of `buf` or fail. A stream that stops making
/// progress mid-message leaves the target with a truncated command,
/// which is fatal for the session.
pub fn write_full<W: Write>(w: &mut W, buf: &[u8]) -> Result<()> {
    match w.write_all(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WriteZero => Err(AttachError::IoShort),
        Err(e) => Err(AttachError::io("writing to attach connection", e)),
    }
}

/// Write `field` followed by the NUL terminator both wire protocols
/// delimit with.
pub fn write_nul_terminated<W: Write>(w: &mut W, field: &str) -> Result<()> {
    write_full(w, field.as_bytes())?;
    write_full(w, &[0])
}

/// Read bytes up to (and consuming) the next NUL. End of stream before
/// the terminator is an error; these protocols never send partial
/// messages on a healthy connection.
pub fn read_nul_terminated<R: Read>(r: &mut R) -> Result<String> {
    let bytes = read_until(r, 0)?
        .ok_or_else(|| AttachError::io(
            "reading reply",
            io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed mid message"),
        ))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Read one `\n` terminated line, the HotSpot status line framing.
pub fn read_line<R: Read>(r: &mut R) -> Result<String> {
    let bytes = read_until(r, b'\n')?
        .ok_or_else(|| AttachError::io(
            "reading status line",
            io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed before status"),
        ))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Slurp whatever is left on the stream, for trailing error messages.
pub fn read_remainder<R: Read>(r: &mut R) -> Result<String> {
    let mut rest = Vec::new();
    r.read_to_end(&mut rest)
        .map_err(|e| AttachError::io("reading trailing message", e))?;
    Ok(String::from_utf8_lossy(&rest).into_owned())
}

/// Read single bytes until `delim`, which is consumed and not
/// returned. Returns None if the stream ends before the delimiter
/// shows up; a frame without its delimiter is no frame.
fn read_until<R: Read>(r: &mut R, delim: u8) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = r
            .read(&mut byte)
            .map_err(|e| AttachError::io("reading from attach connection", e))?;
        if n == 0 {
            return Ok(None);
        }
        if byte[0] == delim {
            return Ok(Some(out));
        }
        out.push(byte[0]);
    }
}
