//! Interactive chat over SSH.
//!
//! Anyone may log in, with any user name and no credentials:
//!
//! ```text
//! ssh ch.at
//! ```
//!
//! Each connection gets one shell. Lines typed at the `> ` prompt are answered as they
//! are generated; `exit`, Ctrl+D or Ctrl+C end the session. Clients over their rate
//! limit, or arriving while every session slot is taken, are told so in plain text and
//! disconnected before the SSH handshake.

pub mod line_editor;
pub mod server;
mod session;

pub use line_editor::LineEditor;
pub use server::{new, SshServer};
