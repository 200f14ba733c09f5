//! Line editing for terminal sessions.
//!
//! [`LineEditor`] is a pure state machine: it consumes input bytes from the
//! client and produces the bytes to echo back plus completed lines. It knows
//! nothing about the transport, so it can be tested byte by byte.

use std::collections::VecDeque;

/// Maximum length of one input line in bytes.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Number of lines kept for up/down history.
pub const MAX_HISTORY: usize = 100;

const BEL: u8 = 0x07;
const CTRL_A: u8 = 0x01;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const CTRL_E: u8 = 0x05;
const BACKSPACE: u8 = 0x08;
const CTRL_U: u8 = 0x15;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// Something the editor finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A complete line, without its terminator.
    Line(String),
    /// Ctrl-C abandoned the current line.
    Interrupt,
    /// Ctrl-D on an empty line.
    Eof,
}

/// Result of processing one input byte.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    /// Bytes to send back to the client.
    pub echo: Vec<u8>,
    /// Completed event, if this byte finished one.
    pub event: Option<LineEvent>,
}

impl Step {
    fn echo(echo: impl Into<Vec<u8>>) -> Self {
        Self {
            echo: echo.into(),
            event: None,
        }
    }

    fn event(echo: impl Into<Vec<u8>>, event: LineEvent) -> Self {
        Self {
            echo: echo.into(),
            event: Some(event),
        }
    }
}

/// ANSI escape sequence parsing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    Normal,
    /// Received ESC.
    Esc,
    /// Received ESC [ and possibly parameter bytes.
    Csi,
    /// Received ESC O.
    Ss3,
}

/// Line editor with echo, cursor movement and history.
#[derive(Debug)]
pub struct LineEditor {
    line: Vec<char>,
    /// Cursor position in chars.
    cursor: usize,
    /// Encoded length of `line` in bytes.
    byte_len: usize,
    history: VecDeque<String>,
    history_index: Option<usize>,
    saved_line: Vec<char>,
    escape: Escape,
    csi_params: Vec<u8>,
    /// Incomplete UTF-8 sequence.
    utf8: Vec<u8>,
    /// The previous byte was CR, so a following LF is swallowed.
    after_cr: bool,
    pending: VecDeque<u8>,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl LineEditor {
    /// Creates an empty editor.
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            cursor: 0,
            byte_len: 0,
            history: VecDeque::with_capacity(MAX_HISTORY),
            history_index: None,
            saved_line: Vec::new(),
            escape: Escape::Normal,
            csi_params: Vec::new(),
            utf8: Vec::new(),
            after_cr: false,
            pending: VecDeque::new(),
        }
    }

    /// Queues bytes received from the client.
    pub fn push_input(&mut self, input: &[u8]) {
        self.pending.extend(input);
    }

    /// Returns true if queued input is waiting for [`step`](Self::step).
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Processes the next queued byte, or returns `None` when the queue is
    /// empty.
    pub fn step(&mut self) -> Option<Step> {
        let byte = self.pending.pop_front()?;
        Some(self.process_byte(byte))
    }

    /// Returns the line being edited.
    pub fn line(&self) -> String {
        self.line.iter().collect()
    }

    /// Returns true if nothing has been typed on the current line.
    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }

    /// Returns the cursor position in characters.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Returns remembered lines, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    /// Bytes that redraw `prompt` and the partial line, leaving the
    /// terminal cursor where the editor cursor is.
    pub fn redraw(&self, prompt: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(prompt.len() + self.byte_len + 8);
        out.extend_from_slice(prompt.as_bytes());
        out.extend_from_slice(self.line().as_bytes());
        cursor_left(&mut out, self.line.len() - self.cursor);
        out
    }

    /// Bytes that erase the prompt and partial line from the screen.
    pub fn erase() -> &'static [u8] {
        b"\r\x1b[K"
    }

    /// Processes one input byte.
    pub fn process_byte(&mut self, byte: u8) -> Step {
        let after_cr = std::mem::replace(&mut self.after_cr, false);

        match self.escape {
            Escape::Esc => {
                self.escape = match byte {
                    b'[' => Escape::Csi,
                    b'O' => Escape::Ss3,
                    _ => Escape::Normal,
                };
                self.csi_params.clear();
                return Step::default();
            }
            Escape::Csi => {
                // Parameter and intermediate bytes precede the final byte.
                if (0x20..0x40).contains(&byte) {
                    self.csi_params.push(byte);
                    return Step::default();
                }
                self.escape = Escape::Normal;
                return self.csi(byte);
            }
            Escape::Ss3 => {
                self.escape = Escape::Normal;
                return self.csi(byte);
            }
            Escape::Normal => {}
        }

        if !self.utf8.is_empty() || byte >= 0x80 {
            return self.utf8_byte(byte);
        }

        match byte {
            b'\n' if after_cr => Step::default(),
            b'\r' | b'\n' => {
                self.after_cr = byte == b'\r';
                self.finish_line()
            }
            BACKSPACE | DEL => self.backspace(),
            CTRL_A => self.home(),
            CTRL_E => self.end(),
            CTRL_C => {
                self.reset_line();
                Step::event(b"^C\r\n".to_vec(), LineEvent::Interrupt)
            }
            CTRL_D => {
                if self.line.is_empty() {
                    Step::event(b"\r\n".to_vec(), LineEvent::Eof)
                } else {
                    self.delete_forward()
                }
            }
            CTRL_U => self.kill_line(),
            ESC => {
                self.escape = Escape::Esc;
                Step::default()
            }
            0x20..=0x7e => self.insert(char::from(byte)),
            _ => Step::default(),
        }
    }

    fn csi(&mut self, byte: u8) -> Step {
        match (byte, self.csi_params.as_slice()) {
            (b'A', _) => self.history_prev(),
            (b'B', _) => self.history_next(),
            (b'C', _) => self.right(),
            (b'D', _) => self.left(),
            (b'H', _) | (b'~', b"1") | (b'~', b"7") => self.home(),
            (b'F', _) | (b'~', b"4") | (b'~', b"8") => self.end(),
            (b'~', b"3") => self.delete_forward(),
            _ => Step::default(),
        }
    }

    fn utf8_byte(&mut self, byte: u8) -> Step {
        let pending = !self.utf8.is_empty();
        self.utf8.push(byte);
        match std::str::from_utf8(&self.utf8) {
            Ok(s) => {
                let c = s.chars().next();
                self.utf8.clear();
                match c {
                    Some(c) if !c.is_control() => self.insert(c),
                    _ => Step::default(),
                }
            }
            Err(e) if e.error_len().is_none() && self.utf8.len() < 4 => Step::default(),
            Err(_) => {
                self.utf8.clear();
                // A byte that cannot continue the sequence stands on its own.
                if pending && byte & 0xC0 != 0x80 {
                    return self.process_byte(byte);
                }
                Step::default()
            }
        }
    }

    fn insert(&mut self, c: char) -> Step {
        if self.byte_len + c.len_utf8() > MAX_LINE_LENGTH {
            return Step::echo(vec![BEL]);
        }
        self.line.insert(self.cursor, c);
        self.cursor += 1;
        self.byte_len += c.len_utf8();

        let mut echo = Vec::new();
        let tail: String = self.line[self.cursor - 1..].iter().collect();
        echo.extend_from_slice(tail.as_bytes());
        cursor_left(&mut echo, self.line.len() - self.cursor);
        Step::echo(echo)
    }

    fn backspace(&mut self) -> Step {
        if self.cursor == 0 {
            return Step::default();
        }
        self.cursor -= 1;
        let removed = self.line.remove(self.cursor);
        self.byte_len -= removed.len_utf8();

        let mut echo = vec![BACKSPACE];
        self.echo_tail_after_delete(&mut echo);
        Step::echo(echo)
    }

    fn delete_forward(&mut self) -> Step {
        if self.cursor == self.line.len() {
            return Step::default();
        }
        let removed = self.line.remove(self.cursor);
        self.byte_len -= removed.len_utf8();

        let mut echo = Vec::new();
        self.echo_tail_after_delete(&mut echo);
        Step::echo(echo)
    }

    fn echo_tail_after_delete(&self, echo: &mut Vec<u8>) {
        let tail: String = self.line[self.cursor..].iter().collect();
        echo.extend_from_slice(tail.as_bytes());
        echo.push(b' ');
        cursor_left(echo, self.line.len() - self.cursor + 1);
    }

    fn left(&mut self) -> Step {
        if self.cursor == 0 {
            return Step::default();
        }
        self.cursor -= 1;
        Step::echo(b"\x1b[D".to_vec())
    }

    fn right(&mut self) -> Step {
        if self.cursor == self.line.len() {
            return Step::default();
        }
        self.cursor += 1;
        Step::echo(b"\x1b[C".to_vec())
    }

    fn home(&mut self) -> Step {
        let mut echo = Vec::new();
        cursor_left(&mut echo, self.cursor);
        self.cursor = 0;
        Step::echo(echo)
    }

    fn end(&mut self) -> Step {
        let mut echo = Vec::new();
        cursor_right(&mut echo, self.line.len() - self.cursor);
        self.cursor = self.line.len();
        Step::echo(echo)
    }

    fn kill_line(&mut self) -> Step {
        let echo = self.replace_line(Vec::new());
        self.history_index = None;
        Step::echo(echo)
    }

    fn finish_line(&mut self) -> Step {
        let line = self.line();
        if !line.trim().is_empty() && self.history.back() != Some(&line) {
            if self.history.len() == MAX_HISTORY {
                self.history.pop_front();
            }
            self.history.push_back(line.clone());
        }
        self.reset_line();
        Step::event(b"\r\n".to_vec(), LineEvent::Line(line))
    }

    fn reset_line(&mut self) {
        self.line.clear();
        self.cursor = 0;
        self.byte_len = 0;
        self.history_index = None;
        self.saved_line.clear();
    }

    /// Replaces the line, returning bytes that clear the old one and show
    /// the new one.
    fn replace_line(&mut self, line: Vec<char>) -> Vec<u8> {
        let mut echo = Vec::new();
        cursor_left(&mut echo, self.cursor);
        echo.extend_from_slice(b"\x1b[K");
        let text: String = line.iter().collect();
        echo.extend_from_slice(text.as_bytes());
        self.byte_len = text.len();
        self.cursor = line.len();
        self.line = line;
        echo
    }

    fn history_prev(&mut self) -> Step {
        let index = match self.history_index {
            _ if self.history.is_empty() => return Step::default(),
            None => {
                self.saved_line = self.line.clone();
                self.history.len() - 1
            }
            Some(0) => return Step::default(),
            Some(i) => i - 1,
        };
        self.history_index = Some(index);
        let line = self.history[index].chars().collect();
        Step::echo(self.replace_line(line))
    }

    fn history_next(&mut self) -> Step {
        match self.history_index {
            None => Step::default(),
            Some(i) if i + 1 >= self.history.len() => {
                self.history_index = None;
                let saved = std::mem::take(&mut self.saved_line);
                Step::echo(self.replace_line(saved))
            }
            Some(i) => {
                self.history_index = Some(i + 1);
                let line = self.history[i + 1].chars().collect();
                Step::echo(self.replace_line(line))
            }
        }
    }
}

fn cursor_left(out: &mut Vec<u8>, n: usize) {
    if n > 0 {
        out.extend_from_slice(format!("\x1b[{n}D").as_bytes());
    }
}

fn cursor_right(out: &mut Vec<u8>, n: usize) {
    if n > 0 {
        out.extend_from_slice(format!("\x1b[{n}C").as_bytes());
    }
}
