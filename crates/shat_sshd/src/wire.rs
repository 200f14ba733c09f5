//! Channel request payload encoding.
//!
//! `pty-req` and `window-change` payloads use the SSH connection protocol
//! layout: big-endian `u32` integers and length-prefixed strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, Window};

/// Request type of a shell start.
pub const SHELL: &str = "shell";
/// Request type of a pseudo-terminal allocation.
pub const PTY_REQ: &str = "pty-req";
/// Request type of a terminal resize.
pub const WINDOW_CHANGE: &str = "window-change";

/// Terminates the encoded terminal mode list.
pub const TTY_OP_END: u8 = 0;

/// Decoded `pty-req` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value of the client's `TERM` variable.
    pub term: String,
    /// Requested dimensions.
    pub window: Window,
    /// Encoded terminal modes, including the terminating `TTY_OP_END`.
    pub modes: Bytes,
}

impl PtyRequest {
    /// Decodes a `pty-req` payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let term = read_string(&mut buf, PTY_REQ, "term")?;
        let term = String::from_utf8(term.to_vec()).map_err(|_| Error::MalformedRequest {
            kind: PTY_REQ,
            reason: "term is not valid UTF-8".to_string(),
        })?;
        let window = read_window(&mut buf, PTY_REQ)?;
        let modes = read_string(&mut buf, PTY_REQ, "modes")?;
        expect_end(buf, PTY_REQ)?;

        Ok(Self {
            term,
            window,
            modes: Bytes::copy_from_slice(modes),
        })
    }

    /// Encodes the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.term.len() + 16 + 4 + self.modes.len());
        put_string(&mut buf, self.term.as_bytes());
        put_window(&mut buf, self.window);
        put_string(&mut buf, &self.modes);
        buf.freeze()
    }
}

/// Decoded `window-change` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    /// New dimensions.
    pub window: Window,
}

impl WindowChange {
    /// Decodes a `window-change` payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let window = read_window(&mut buf, WINDOW_CHANGE)?;
        expect_end(buf, WINDOW_CHANGE)?;
        Ok(Self { window })
    }

    /// Encodes the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        put_window(&mut buf, self.window);
        buf.freeze()
    }
}

/// Encodes terminal modes as opcode and argument pairs followed by
/// `TTY_OP_END`.
pub fn encode_modes(modes: &[(u8, u32)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(modes.len() * 5 + 1);
    for &(opcode, value) in modes {
        // Opcodes 160 and above take arguments this encoding cannot carry.
        if opcode == TTY_OP_END || opcode >= 160 {
            continue;
        }
        buf.put_u8(opcode);
        buf.put_u32(value);
    }
    buf.put_u8(TTY_OP_END);
    buf.freeze()
}

fn read_u32(buf: &mut &[u8], kind: &'static str, field: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(kind, field));
    }
    Ok(buf.get_u32())
}

fn read_string<'a>(buf: &mut &'a [u8], kind: &'static str, field: &str) -> Result<&'a [u8]> {
    let len = read_u32(buf, kind, field)? as usize;
    if buf.remaining() < len {
        return Err(truncated(kind, field));
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Ok(value)
}

fn read_window(buf: &mut &[u8], kind: &'static str) -> Result<Window> {
    let width = read_u32(buf, kind, "width")?;
    let height = read_u32(buf, kind, "height")?;
    let pixel_width = read_u32(buf, kind, "pixel width")?;
    let pixel_height = read_u32(buf, kind, "pixel height")?;
    Ok(Window::new(width, height).with_pixels(pixel_width, pixel_height))
}

fn expect_end(buf: &[u8], kind: &'static str) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(Error::MalformedRequest {
            kind,
            reason: format!("{} trailing bytes", buf.len()),
        })
    }
}

fn truncated(kind: &'static str, field: &str) -> Error {
    Error::MalformedRequest {
        kind,
        reason: format!("truncated at {field}"),
    }
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_window(buf: &mut BytesMut, window: Window) {
    buf.put_u32(window.width);
    buf.put_u32(window.height);
    buf.put_u32(window.pixel_width);
    buf.put_u32(window.pixel_height);
}
