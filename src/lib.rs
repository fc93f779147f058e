//! # Description
//!
//! This crate implements non-blocking HTTP/1.x document retrieval as an explicit,
//! resumable state machine.
//!
//! A [`channel::HttpChannel`] owns one logical line of communication to a server: it
//! builds request text, drives the connect / proxy-tunnel / TLS-handshake / send /
//! receive sequence one bounded unit of work at a time, parses the status line and
//! headers, and transparently handles authentication retries and redirects. The
//! response body can either be pulled through a [`body::BodyReader`] or pushed to a
//! file or in-memory [`ramfile::Ramfile`] as a throttled background download.
//!
//! # Driving a channel
//!
//! The channel never spawns threads and never blocks in non-blocking mode. After
//! beginning a request, call [`channel::HttpChannel::run`] until it returns `false`:
//! each call performs as much protocol work as it can without waiting, and `true`
//! means "call me again later". Blocking convenience wrappers such as
//! [`channel::HttpChannel::get_document`] drive the same machine to completion
//! internally.
//!
//! ```no_run
//! use std::rc::Rc;
//! use docfetch::channel::HttpChannel;
//! use docfetch::client::DocClient;
//!
//! let client = Rc::new(DocClient::new());
//! let mut channel = HttpChannel::new(client);
//!
//! let url = docfetch::url::Url::parse("http://icanhazip.com/").unwrap();
//! channel.begin_get_document(url);
//! while channel.run() {
//!     // interleave with other application work
//! }
//! assert!(channel.is_valid());
//! println!("{} {}", channel.status_code(), channel.status_string());
//! ```
//!
//! # Errors
//!
//! The philosophy of this crate is that an [`Err`] should always represent a
//! transport or protocol-level error, never a condition that is handled during
//! **normal** branching logic. [`std::io::ErrorKind::WouldBlock`] does not escape
//! any public API: partial progress is reported through `Ok` outcome enums such as
//! [`body::BodyRead::Pending`], and the channel itself surfaces failure purely
//! through observable state ([`channel::HttpChannel::is_valid`], the status code)
//! plus a diagnostic log line.
//!
//! # Collaborators
//!
//! The byte transport is abstracted behind [`transport::Transport`] so that the
//! protocol machinery can be exercised against a scripted [`mock::MockTransport`];
//! the provided [`transport::TcpTransport`] implements it over non-blocking TCP
//! with optional TLS. Proxy selection, HTTP version, TLS policy, and credential
//! lookup live behind [`client::ClientContext`], with [`client::DocClient`] as the
//! default implementation.

pub extern crate http;
pub extern crate url;

pub mod auth;
pub mod body;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod clock;
pub mod mock;
pub mod ramfile;
pub mod stream;
pub mod transport;
