//! webterm - interactive shell access through the browser.
//!
//! An authenticated user opens a web page; a PTY-attached login shell on the
//! server is streamed bidirectionally over a binary WebSocket protocol.
//! Multiple tabs can attach to one shell with coordinated input arbitration
//! (a single elected writer), shared output, and shared scrollback.
//!
//! Architecture:
//! - `session`: PTY sessions, the multi-client fan-out, writer election,
//!   tmux-style minimum sizing, and the process-wide registry
//! - `protocol`: the binary frame codec
//! - `api`: the axum control plane and the per-tab streaming endpoint
//! - `transfer`: the per-connection file-upload machine
//! - `pty`, `ring`, `config`, `tls`, `shutdown`: supporting pieces

pub mod api;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod ring;
pub mod session;
pub mod shutdown;
pub mod tls;
pub mod transfer;
