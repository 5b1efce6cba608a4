//! Terminal line discipline for chat sessions.
//!
//! The client's terminal is in raw mode, so the server echoes what is typed, handles
//! erasing, and decides when a line is complete. [`LineEditor`] does this over raw input
//! bytes without touching the connection; the session writes out whatever it returns.

/// Shown once the shell starts.
pub const WELCOME: &str =
    "Welcome to ch.at\r\nType your message and press Enter. Type 'exit' to quit.\r\n> ";
pub const PROMPT: &str = "> ";
pub const GOODBYE: &str = "Goodbye!\r\n";

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const TAB: u8 = b'\t';
const DELETE: u8 = 0x7f;
const ERASE: &[u8] = b"\x08 \x08";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    Collecting,
    /// A line was completed and handed out, generation hasn't started.
    LineReady,
    Generating,
    Terminated,
}

/// What the session should do in response to input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes back to the terminal.
    Echo(Vec<u8>),
    /// Generate an answer to this prompt.
    Submit(String),
    /// End the session normally.
    Exit,
    /// End the session at the client's interrupt.
    Abort,
}

#[derive(Debug)]
pub struct LineEditor {
    buffer: Vec<u8>,
    state: EditorState,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl LineEditor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: EditorState::Collecting,
        }
    }

    #[must_use]
    pub fn state(&self) -> EditorState {
        self.state
    }

    /// Feed raw terminal input. Input arriving while an answer is pending is dropped,
    /// except for Ctrl+C.
    pub fn input(&mut self, data: &[u8]) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut echo = Vec::new();

        for &byte in data {
            match self.state {
                EditorState::Terminated => break,
                EditorState::LineReady | EditorState::Generating => {
                    if byte == CTRL_C {
                        flush(&mut echo, &mut actions);
                        self.terminate(&mut actions, Action::Abort);
                    }
                    continue;
                }
                EditorState::Collecting => {}
            }

            match byte {
                CTRL_C => {
                    echo.extend_from_slice(b"^C\r\n");
                    flush(&mut echo, &mut actions);
                    self.terminate(&mut actions, Action::Abort);
                }
                CTRL_D => {
                    echo.extend_from_slice(b"\r\n");
                    flush(&mut echo, &mut actions);
                    self.terminate(&mut actions, Action::Exit);
                }
                b'\r' | b'\n' => {
                    if self.buffer.is_empty() {
                        continue;
                    }
                    echo.extend_from_slice(b"\r\n");
                    self.complete_line(&mut echo, &mut actions);
                }
                BACKSPACE | DELETE => {
                    if self.erase_last_char() {
                        echo.extend_from_slice(ERASE);
                    }
                }
                byte if byte < 0x20 && byte != TAB => {}
                byte => {
                    self.buffer.push(byte);
                    echo.push(byte);
                }
            }
        }

        flush(&mut echo, &mut actions);
        actions
    }

    /// Move on from a line handed out by [`LineEditor::input`] to waiting for its answer.
    pub fn start_generation(&mut self) {
        if self.state == EditorState::LineReady {
            self.state = EditorState::Generating;
        }
    }

    /// The answer has been written. Returns the prompt to show, if the session is still
    /// going.
    pub fn finish_generation(&mut self) -> Option<&'static str> {
        match self.state {
            EditorState::LineReady | EditorState::Generating => {
                self.state = EditorState::Collecting;
                Some(PROMPT)
            }
            EditorState::Collecting => Some(PROMPT),
            EditorState::Terminated => None,
        }
    }

    fn complete_line(&mut self, echo: &mut Vec<u8>, actions: &mut Vec<Action>) {
        let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();

        if line.is_empty() {
            echo.extend_from_slice(PROMPT.as_bytes());
        } else if line == "exit" {
            echo.extend_from_slice(GOODBYE.as_bytes());
            flush(echo, actions);
            self.terminate(actions, Action::Exit);
        } else {
            flush(echo, actions);
            self.state = EditorState::LineReady;
            actions.push(Action::Submit(line));
        }
    }

    /// Remove the last UTF-8 character from the buffer.
    fn erase_last_char(&mut self) -> bool {
        let Some(mut byte) = self.buffer.pop() else {
            return false;
        };
        while is_continuation(byte) {
            match self.buffer.pop() {
                Some(b) => byte = b,
                None => break,
            }
        }
        true
    }

    fn terminate(&mut self, actions: &mut Vec<Action>, action: Action) {
        self.buffer.clear();
        self.state = EditorState::Terminated;
        actions.push(action);
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

fn flush(echo: &mut Vec<u8>, actions: &mut Vec<Action>) {
    if !echo.is_empty() {
        actions.push(Action::Echo(std::mem::take(echo)));
    }
}
