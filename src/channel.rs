//! The document retrieval state machine.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use http::{Method, Version};
use log::{debug, info, trace, warn};
use url::Url;

use crate::body::{BodyReader, BodyRead, BodySignal, ChunkedBodyDecoder, IdentityBodyDecoder};
use crate::client::{http_version_string, server_and_port, url_port, ClientContext};
use crate::clock::{Clock, RealClock};
use crate::ramfile::Ramfile;
use crate::stream::{ConnectionStream, LineOutcome};
use crate::transport::{ConnectOutcome, TlsOutcome};

/// Bodies no larger than this are skipped in place to keep a persistent
/// connection; anything bigger is cheaper to re-establish.
const MAX_SKIP_BYTES: usize = 8192;

/// Tunable connection and download behavior of a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Seconds to wait for a connection attempt before giving up.
    pub connect_timeout_seconds: f64,
    /// Wait out the full connect timeout even in non-blocking mode.
    pub blocking_connect: bool,
    /// Pace non-blocking downloads instead of reading as fast as possible.
    pub download_throttle: bool,
    /// Target download rate while throttled.
    pub max_bytes_per_second: f64,
    /// How often a throttled download wakes up to request another batch.
    pub seconds_per_update: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 30.0,
            blocking_connect: false,
            download_throttle: false,
            max_bytes_per_second: 500_000.0,
            seconds_per_update: 0.2,
        }
    }
}

// Ordered: begin_request relies on comparing how far a pending request
// progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    New,
    Connecting,
    ConnectingWait,
    ProxyReady,
    ProxyRequestSent,
    ProxyReadingHeader,
    SetupTls,
    TlsHandshake,
    Ready,
    RequestSent,
    ReadingHeader,
    ReadHeader,
    BeginBody,
    ReadingBody,
    ReadBody,
    ReadTrailer,
    Failure,
}

/// What kind of response the previous exchange on this connection produced,
/// used to decide whether a failure deserves one automatic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseType {
    None,
    Hangup,
    NonHttp,
    Http,
}

enum DownloadDest {
    None,
    File { path: PathBuf, file: File },
    Ram(Rc<RefCell<Ramfile>>),
}

#[derive(Clone, Copy)]
enum RequestKind {
    Proxy,
    Main,
}

/// One logical line of communication to one server.
///
/// A channel carries a single request at a time through connect, optional
/// proxy tunnelling, optional TLS, request send, and response header parse.
/// In non-blocking mode each [`HttpChannel::run`] call does a bounded amount
/// of work; the blocking convenience methods ([`HttpChannel::get_document`]
/// and friends) drive the same machine to completion internally.
///
/// Authentication challenges (401, 407) and redirect responses are retried
/// automatically, each at most once per request, before the final status is
/// surfaced through [`HttpChannel::status_code`] and
/// [`HttpChannel::is_valid`].
pub struct HttpChannel {
    client: Rc<dyn ClientContext>,
    clock: Rc<dyn Clock>,
    config: ChannelConfig,
    bytes_per_update: usize,

    persistent_connection: bool,
    nonblocking: bool,
    proxy: Option<Url>,
    method: Method,
    url: Url,
    body: String,
    want_tls: bool,
    proxy_serves_document: bool,
    proxy_tunnel: bool,
    server_response_has_no_body: bool,
    first_byte: usize,
    last_byte: usize,

    file_size: usize,
    bytes_downloaded: usize,
    bytes_requested: usize,
    status_code: usize,
    status_string: String,
    http_version: Version,
    http_version_string: String,
    redirect: String,
    headers: BTreeMap<String, String>,
    current_field_name: String,
    current_field_value: String,

    proxy_realm: String,
    proxy_username: String,
    proxy_auth: Option<Rc<dyn crate::auth::Authorization>>,
    www_realm: String,
    www_username: String,
    www_auth: Option<Rc<dyn crate::auth::Authorization>>,

    state: State,
    done_state: State,
    response_type: ResponseType,
    last_status_code: usize,
    redirect_trail: BTreeSet<String>,
    started_connecting_time: f64,
    last_run_time: f64,

    proxy_header: String,
    proxy_request_text: String,
    header: String,
    request_text: String,
    extra_headers: String,
    sent_so_far: usize,

    source: Option<Rc<RefCell<ConnectionStream>>>,
    body_reader: Option<BodyReader>,
    body_signal: BodySignal,

    started_download: bool,
    download_complete: bool,
    subdocument_resumes: bool,
    download_dest: DownloadDest,
}

impl HttpChannel {
    pub fn new(client: Rc<dyn ClientContext>) -> Self {
        let config = ChannelConfig::default();
        let bytes_per_update = (config.max_bytes_per_second * config.seconds_per_update) as usize;
        let proxy = client.proxy();
        let http_version = client.http_version();
        Self {
            client,
            clock: Rc::new(RealClock::new()),
            config,
            bytes_per_update,
            persistent_connection: false,
            nonblocking: false,
            proxy,
            method: Method::GET,
            url: Url::parse("http://localhost/").expect("default url"),
            body: String::new(),
            want_tls: false,
            proxy_serves_document: false,
            proxy_tunnel: false,
            server_response_has_no_body: false,
            first_byte: 0,
            last_byte: 0,
            file_size: 0,
            bytes_downloaded: 0,
            bytes_requested: 0,
            status_code: 0,
            status_string: String::new(),
            http_version,
            http_version_string: http_version_string(http_version).to_string(),
            redirect: String::new(),
            headers: BTreeMap::new(),
            current_field_name: String::new(),
            current_field_value: String::new(),
            proxy_realm: String::new(),
            proxy_username: String::new(),
            proxy_auth: None,
            www_realm: String::new(),
            www_username: String::new(),
            www_auth: None,
            state: State::New,
            done_state: State::New,
            response_type: ResponseType::None,
            last_status_code: 0,
            redirect_trail: BTreeSet::new(),
            started_connecting_time: 0.0,
            last_run_time: 0.0,
            proxy_header: String::new(),
            proxy_request_text: String::new(),
            header: String::new(),
            request_text: String::new(),
            extra_headers: String::new(),
            sent_so_far: 0,
            source: None,
            body_reader: None,
            body_signal: BodySignal::new(),
            started_download: false,
            download_complete: false,
            subdocument_resumes: false,
            download_dest: DownloadDest::None,
        }
    }

    /// Replaces the time source, mainly so tests can advance time by hand.
    pub fn set_clock(&mut self, clock: Rc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ChannelConfig) {
        self.config = config;
        self.recompute_throttle();
    }

    pub fn set_connect_timeout(&mut self, seconds: f64) {
        self.config.connect_timeout_seconds = seconds;
    }

    pub fn set_blocking_connect(&mut self, blocking_connect: bool) {
        self.config.blocking_connect = blocking_connect;
    }

    pub fn set_download_throttle(&mut self, download_throttle: bool) {
        self.config.download_throttle = download_throttle;
    }

    pub fn set_max_bytes_per_second(&mut self, max_bytes_per_second: f64) {
        self.config.max_bytes_per_second = max_bytes_per_second;
        self.recompute_throttle();
    }

    pub fn set_max_updates_per_second(&mut self, max_updates_per_second: f64) {
        self.config.seconds_per_update = 1.0 / max_updates_per_second;
        self.recompute_throttle();
    }

    fn recompute_throttle(&mut self) {
        self.bytes_per_update =
            (self.config.max_bytes_per_second * self.config.seconds_per_update) as usize;
    }

    /// Keep the connection open across requests when the server allows it.
    pub fn set_persistent_connection(&mut self, persistent_connection: bool) {
        self.persistent_connection = persistent_connection;
    }

    pub fn persistent_connection(&self) -> bool {
        self.persistent_connection
    }

    /// Adds a header line to be sent with the next request only.
    pub fn send_extra_header(&mut self, key: &str, value: &str) {
        self.extra_headers.push_str(&format!("{key}: {value}\r\n"));
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The numeric status of the last response. Values above 1000 are proxy
    /// failures, offset to distinguish them from the same codes returned by
    /// the destination server.
    pub fn status_code(&self) -> usize {
        self.status_code
    }

    pub fn status_string(&self) -> &str {
        &self.status_string
    }

    pub fn http_version(&self) -> Version {
        self.http_version
    }

    pub fn http_version_string(&self) -> &str {
        &self.http_version_string
    }

    /// The value of the named response header, joined with `", "` if the
    /// server repeated it, or empty if absent. Lookup is case-insensitive.
    pub fn header_value(&self, key: &str) -> String {
        self.headers
            .get(&key.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_headers(&self, out: &mut dyn io::Write) -> io::Result<()> {
        for (name, value) in &self.headers {
            writeln!(out, "{name}: {value}")?;
        }
        Ok(())
    }

    /// Announced size of the document, or 0 if the server did not say.
    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn first_byte(&self) -> usize {
        self.first_byte
    }

    pub fn last_byte(&self) -> usize {
        self.last_byte
    }

    pub fn bytes_downloaded(&self) -> usize {
        self.bytes_downloaded
    }

    pub fn bytes_requested(&self) -> usize {
        self.bytes_requested
    }

    pub fn redirect(&self) -> &str {
        &self.redirect
    }

    pub fn www_realm(&self) -> &str {
        &self.www_realm
    }

    pub fn proxy_realm(&self) -> &str {
        &self.proxy_realm
    }

    /// True if the last request got a successful response.
    pub fn is_valid(&self) -> bool {
        self.state != State::Failure && self.status_code / 100 == 2
    }

    /// True if a connection established via a connect request is available to
    /// be taken with [`HttpChannel::take_connection`].
    pub fn is_connection_ready(&self) -> bool {
        self.source.is_some() && self.state == State::Ready
    }

    /// True once a requested download has arrived in full. A communications
    /// error can leave a partial file behind with this still false.
    pub fn is_download_complete(&self) -> bool {
        self.download_complete
    }

    /// True if the server has indicated it will close the connection after
    /// this document.
    pub fn will_close_connection(&self) -> bool {
        if self.http_version < Version::HTTP_11 {
            return true;
        }
        self.header_value("connection").eq_ignore_ascii_case("close")
    }

    // Convenience wrappers around begin_request().

    /// Fetches a document, blocking until the headers are available. Returns
    /// true on a successful status; the body can then be pulled with
    /// [`HttpChannel::read_body`] or downloaded.
    pub fn get_document(&mut self, url: Url) -> bool {
        self.begin_request(Method::GET, url, "", false, 0, 0);
        self.run_to_completion();
        self.is_valid()
    }

    /// Fetches only the byte range `[first_byte, last_byte]` of a document
    /// (`last_byte` of 0 means to the end).
    pub fn get_subdocument(&mut self, url: Url, first_byte: usize, last_byte: usize) -> bool {
        self.begin_request(Method::GET, url, "", false, first_byte, last_byte);
        self.run_to_completion();
        self.is_valid()
    }

    /// Fetches just the headers of a document.
    pub fn get_header(&mut self, url: Url) -> bool {
        self.begin_request(Method::HEAD, url, "", false, 0, 0);
        self.run_to_completion();
        self.is_valid()
    }

    /// Posts url-encoded form data and blocks for the response headers.
    pub fn post_form(&mut self, url: Url, body: &str) -> bool {
        self.begin_request(Method::POST, url, body, false, 0, 0);
        self.run_to_completion();
        self.is_valid()
    }

    /// Establishes a raw connection to the server named by the URL, via the
    /// proxy if one is configured. On success the connection can be taken
    /// with [`HttpChannel::take_connection`].
    pub fn connect_to(&mut self, url: Url) -> bool {
        self.begin_request(Method::CONNECT, url, "", false, 0, 0);
        self.run_to_completion();
        self.is_connection_ready()
    }

    /// Non-blocking variant of [`HttpChannel::get_document`]; drive with
    /// [`HttpChannel::run`].
    pub fn begin_get_document(&mut self, url: Url) {
        self.begin_request(Method::GET, url, "", true, 0, 0);
    }

    /// Non-blocking variant of [`HttpChannel::get_subdocument`].
    pub fn begin_get_subdocument(&mut self, url: Url, first_byte: usize, last_byte: usize) {
        self.begin_request(Method::GET, url, "", true, first_byte, last_byte);
    }

    /// Non-blocking variant of [`HttpChannel::get_header`].
    pub fn begin_get_header(&mut self, url: Url) {
        self.begin_request(Method::HEAD, url, "", true, 0, 0);
    }

    /// Non-blocking variant of [`HttpChannel::post_form`].
    pub fn begin_post_form(&mut self, url: Url, body: &str) {
        self.begin_request(Method::POST, url, body, true, 0, 0);
    }

    /// Non-blocking variant of [`HttpChannel::connect_to`].
    pub fn begin_connect_to(&mut self, url: Url) {
        self.begin_request(Method::CONNECT, url, "", true, 0, 0);
    }

    fn run_to_completion(&mut self) {
        while self.run() {}
    }

    /// Begins a new document request, throwing away whatever request was
    /// currently pending if necessary.
    pub fn begin_request(
        &mut self,
        method: Method,
        url: Url,
        body: &str,
        nonblocking: bool,
        first_byte: usize,
        last_byte: usize,
    ) {
        self.reset_for_new_request();

        // Changing the proxy, or the nonblocking state, is grounds for
        // dropping the old connection, if any.
        let client_proxy = self.client.proxy();
        if self.proxy != client_proxy {
            self.proxy = client_proxy;
            self.reset_to_new();
        }

        if self.nonblocking != nonblocking {
            self.nonblocking = nonblocking;
            self.reset_to_new();
        }

        self.set_url(url);
        self.method = method;
        self.body = body.to_string();

        self.want_tls = self.url.scheme() == "https";

        // With a proxy, we ask the proxy for the document, except over TLS
        // where we tunnel through the proxy and talk to the server directly.
        self.proxy_serves_document = self.proxy.is_some() && !self.want_tls;

        self.first_byte = first_byte;
        self.last_byte = last_byte;

        self.make_header();
        self.make_request_text();

        if self.proxy.is_some() && (self.want_tls || self.method == Method::CONNECT) {
            let mut request = format!(
                "CONNECT {} {}\r\n",
                server_and_port(&self.url),
                http_version_string(self.client.http_version())
            );
            if self.client.http_version() >= Version::HTTP_11 {
                request.push_str(&format!(
                    "Host: {}\r\n",
                    self.url.host_str().unwrap_or_default()
                ));
            }
            self.proxy_header = request;
            self.make_proxy_request_text();
        } else {
            self.proxy_header.clear();
            self.proxy_request_text.clear();
        }

        // Also, reset from whatever previous request might still be pending.
        if self.state == State::Failure
            || (self.state < State::ReadHeader && self.state != State::Ready)
        {
            self.reset_to_new();
        } else if self.state == State::ReadHeader {
            // Roll one step forwards to start skipping past the previous body.
            self.state = State::BeginBody;
        }

        self.done_state = if self.method == Method::CONNECT {
            State::Ready
        } else {
            State::ReadHeader
        };
    }

    /// Performs as much work towards the current task as possible without
    /// waiting. Returns true if the task is still pending and `run()` must be
    /// called again later, or false once it has completed.
    pub fn run(&mut self) -> bool {
        if self.state == self.done_state || self.state == State::Failure {
            self.extra_headers.clear();
            if !self.reached_done_state() {
                return false;
            }
        }

        if self.started_download {
            if self.nonblocking && self.config.download_throttle {
                let now = self.clock.now_seconds();
                let elapsed = now - self.last_run_time;
                if elapsed < self.config.seconds_per_update {
                    // Come back later.
                    return true;
                }
                let num_potential_updates = (elapsed / self.config.seconds_per_update) as usize;
                self.last_run_time = now;
                self.bytes_requested += self.bytes_per_update * num_potential_updates;
                trace!(
                    "elapsed = {elapsed:.3} num_potential_updates = {num_potential_updates} \
                     bytes_requested = {}",
                    self.bytes_requested
                );
            }
            return match self.download_dest {
                DownloadDest::None => false,
                DownloadDest::File { .. } | DownloadDest::Ram(_) => self.run_download(),
            };
        }

        trace!(
            "begin run(), state = {:?}, done_state = {:?}",
            self.state,
            self.done_state
        );

        if self.state == self.done_state {
            return self.reached_done_state();
        }

        loop {
            if self.source.is_none() {
                // No connection. Attempt to establish one.
                self.proxy = self.client.proxy();
                let conn_url = self.proxy.clone().unwrap_or_else(|| self.url.clone());
                let host = conn_url.host_str().unwrap_or_default().to_string();
                let port = url_port(&conn_url);
                match self.client.open_transport(&host, port, self.nonblocking) {
                    Ok(transport) => {
                        self.source =
                            Some(Rc::new(RefCell::new(ConnectionStream::new(transport))));
                    }
                    Err(err) => {
                        info!("Could not connect to {host}:{port}: {err}");
                        self.state = State::Failure;
                        self.extra_headers.clear();
                        return self.reached_done_state();
                    }
                }
                self.state = State::Connecting;
                self.started_connecting_time = self.clock.now_seconds();
            }

            trace!("continue run(), state = {:?}", self.state);

            let repeat_later = match self.state {
                State::Connecting => self.run_connecting(),
                State::ConnectingWait => self.run_connecting_wait(),
                State::ProxyReady => self.run_proxy_ready(),
                State::ProxyRequestSent => self.run_proxy_request_sent(),
                State::ProxyReadingHeader => self.run_proxy_reading_header(),
                State::SetupTls => self.run_setup_tls(),
                State::TlsHandshake => self.run_tls_handshake(),
                State::Ready => self.run_ready(),
                State::RequestSent => self.run_request_sent(),
                State::ReadingHeader => self.run_reading_header(),
                State::ReadHeader => self.run_read_header(),
                State::BeginBody => self.run_begin_body(),
                State::ReadingBody => self.run_reading_body(),
                State::ReadBody => self.run_read_body(),
                State::ReadTrailer => self.run_read_trailer(),
                State::New | State::Failure => {
                    warn!("Unhandled state {:?}", self.state);
                    return false;
                }
            };

            if self.state == self.done_state || self.state == State::Failure {
                // We've reached our terminal state.
                self.extra_headers.clear();
                return self.reached_done_state();
            }

            if repeat_later && self.source.is_some() {
                break;
            }
        }

        trace!(
            "later run(), state = {:?}, done_state = {:?}",
            self.state,
            self.done_state
        );
        true
    }

    /// Returns a decoder for the body of the document just retrieved. May
    /// only be called right after the headers have been read, i.e. after
    /// `get_document()` returned or `run()` returned false.
    pub fn read_body(&mut self) -> Option<BodyReader> {
        if (self.state != State::ReadHeader && self.state != State::BeginBody)
            || self.source.is_none()
        {
            return None;
        }
        let source = Rc::clone(self.source.as_ref()?);

        let transfer_coding = self.header_value("transfer-encoding").to_ascii_lowercase();
        let content_length = self.header_value("content-length");

        self.body_signal = BodySignal::new();
        let reader = if transfer_coding == "chunked" {
            // The body length is discovered chunk by chunk as we go.
            self.file_size = 0;
            BodyReader::Chunked(ChunkedBodyDecoder::new(source, self.body_signal.clone()))
        } else {
            // Anything else is treated as "identity": the literal bytes
            // following the header, counted out if a length was announced,
            // otherwise up to end of file.
            let length = if content_length.is_empty() {
                None
            } else {
                Some(self.file_size)
            };
            BodyReader::Identity(IdentityBodyDecoder::new(
                source,
                self.body_signal.clone(),
                length,
            ))
        };
        self.state = State::ReadingBody;
        Some(reader)
    }

    /// Streams the document into the named file as `run()` is called. With
    /// `subdocument_resumes`, a ranged request seeks to its starting byte
    /// within an existing file instead of truncating it.
    pub fn download_to_file(&mut self, filename: &Path, subdocument_resumes: bool) -> bool {
        self.reset_download_to();
        self.subdocument_resumes = subdocument_resumes && self.first_byte != 0;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(!self.subdocument_resumes)
            .open(filename);
        let file = match file {
            Ok(file) => file,
            Err(err) => {
                info!("Could not open {} for writing: {err}", filename.display());
                return false;
            }
        };

        self.download_dest = DownloadDest::File {
            path: filename.to_path_buf(),
            file,
        };
        if !self.reset_download_position() {
            self.reset_download_to();
            return false;
        }

        if self.nonblocking {
            // The download proceeds as run() is called.
            return true;
        }

        self.run_to_completion();
        self.is_download_complete()
    }

    /// Streams the document into a shared [`Ramfile`] as `run()` is called.
    pub fn download_to_ram(
        &mut self,
        ramfile: &Rc<RefCell<Ramfile>>,
        subdocument_resumes: bool,
    ) -> bool {
        self.reset_download_to();
        ramfile.borrow_mut().seek(0);
        self.download_dest = DownloadDest::Ram(Rc::clone(ramfile));
        self.subdocument_resumes = subdocument_resumes && self.first_byte != 0;

        if !self.reset_download_position() {
            self.reset_download_to();
            return false;
        }

        if self.nonblocking {
            // The download proceeds as run() is called.
            return true;
        }

        self.run_to_completion();
        self.is_download_complete()
    }

    /// Detaches and returns the connection established by a previous
    /// connect request, resetting the channel. Ownership of the stream
    /// passes to the caller.
    pub fn take_connection(&mut self) -> Option<ConnectionStream> {
        if !self.is_connection_ready() {
            return None;
        }
        self.body_reader = None;
        let source = self.source.take()?;
        self.reset_to_new();
        match Rc::try_unwrap(source) {
            Ok(cell) => Some(cell.into_inner()),
            Err(source) => {
                self.source = Some(source);
                None
            }
        }
    }

    /// Abandons the current request, closing any open connection.
    pub fn reset(&mut self) {
        self.reset_to_new();
        self.reset_download_to();
        self.status_code = 0;
        self.status_string.clear();
        self.headers.clear();
    }

    // Per-state handlers. Each returns true to be called back later, false
    // to continue immediately with the (possibly updated) state.

    fn run_connecting(&mut self) -> bool {
        self.status_code = 0;
        self.status_string.clear();
        let source = match &self.source {
            Some(source) => Rc::clone(source),
            None => return false,
        };
        let (outcome, host, port) = {
            let mut stream = source.borrow_mut();
            let outcome = stream.transport_mut().try_connect();
            let host = stream.transport().host().to_string();
            let port = stream.transport().port();
            (outcome, host, port)
        };
        match outcome {
            Ok(ConnectOutcome::Retry) => {
                self.state = State::ConnectingWait;
                false
            }
            Ok(ConnectOutcome::Connected) => {
                debug!("Connected to {host}:{port}");
                self.state = if self.proxy.is_some() {
                    State::ProxyReady
                } else if self.want_tls {
                    State::SetupTls
                } else {
                    State::Ready
                };
                false
            }
            Err(err) => {
                info!("Could not connect to {host}:{port}: {err}");
                self.state = State::Failure;
                false
            }
        }
    }

    fn run_connecting_wait(&mut self) -> bool {
        let source = match &self.source {
            Some(source) => Rc::clone(source),
            None => return false,
        };
        debug!(
            "waiting to connect to {}",
            server_and_port(&self.url)
        );
        let timeout = if self.config.blocking_connect {
            // We'll wait out the whole timeout in one call.
            Some(Duration::from_secs_f64(self.config.connect_timeout_seconds))
        } else {
            Some(Duration::ZERO)
        };
        let outcome = source.borrow_mut().transport_mut().wait_writable(timeout);
        match outcome {
            Err(err) => {
                warn!("Error waiting for connection: {err}");
                self.state = State::Failure;
                false
            }
            Ok(false) => {
                if self.config.blocking_connect
                    || (self.clock.now_seconds() - self.started_connecting_time
                        > self.config.connect_timeout_seconds)
                {
                    info!("Timeout connecting to {}", server_and_port(&self.url));
                    self.state = State::Failure;
                    false
                } else {
                    true
                }
            }
            Ok(true) => {
                // The socket is now ready for writing.
                self.state = State::Connecting;
                false
            }
        }
    }

    fn run_proxy_ready(&mut self) -> bool {
        // If there's a request to be sent to the proxy, send it now.
        if !self.proxy_request_text.is_empty() {
            if !self.http_send(RequestKind::Proxy) {
                return true;
            }
            self.state = State::ProxyRequestSent;
        } else {
            self.state = State::Ready;
        }
        false
    }

    fn run_proxy_request_sent(&mut self) -> bool {
        // Wait for the first line to come back from the proxy.
        let line = match self.http_getline() {
            LineOutcome::Line(line) => line,
            LineOutcome::Pending => return true,
            LineOutcome::Closed => {
                // The proxy hung up on us as soon as we tried to connect.
                if self.response_type == ResponseType::Hangup {
                    // Second immediate hangup in a row. Give up.
                    self.state = State::Failure;
                } else {
                    // Try again, once.
                    self.response_type = ResponseType::Hangup;
                }
                return true;
            }
        };

        if !self.parse_http_response(&line) {
            return false;
        }

        self.state = State::ProxyReadingHeader;
        self.current_field_name.clear();
        self.current_field_value.clear();
        self.headers.clear();
        self.file_size = 0;
        false
    }

    fn run_proxy_reading_header(&mut self) -> bool {
        if self.parse_http_header() {
            return true;
        }

        self.redirect = self.header_value("location");

        self.server_response_has_no_body = self.status_code / 100 == 1
            || self.status_code == 204
            || self.status_code == 304;

        let last_status = self.last_status_code;
        self.last_status_code = self.status_code;

        if self.status_code == 407 && last_status != 407 && self.proxy.is_some() {
            // Not authorized to proxy. Try to get the authorization.
            let challenge = self.header_value("proxy-authenticate");
            if let Some(proxy) = self.proxy.clone() {
                self.proxy_auth = self.client.generate_auth(&proxy, true, &challenge);
                if let Some(auth) = self.proxy_auth.clone() {
                    self.proxy_realm = auth.realm().to_string();
                    self.proxy_username = self
                        .client
                        .select_username(&proxy, true, &self.proxy_realm)
                        .unwrap_or_default();
                    if !self.proxy_username.is_empty() {
                        self.make_proxy_request_text();
                        // Roll the state forward to force a new request.
                        self.state = State::BeginBody;
                        return false;
                    }
                }
            }
        }

        if !self.is_valid() {
            // Proxy wouldn't open the connection. Offset the status code so
            // it can't be mistaken for one from the destination server.
            if self.status_code != 407 {
                self.status_code += 1000;
            }
            self.state = State::Failure;
            return false;
        }

        // Now we have a tunnel opened through the proxy.
        self.proxy_tunnel = true;
        self.make_request_text();

        self.state = if self.want_tls {
            State::SetupTls
        } else {
            State::Ready
        };
        false
    }

    fn run_setup_tls(&mut self) -> bool {
        let source = match &self.source {
            Some(source) => Rc::clone(source),
            None => return false,
        };
        debug!("performing TLS handshake");
        self.state = State::TlsHandshake;
        let domain = self.url.host_str().unwrap_or_default().to_string();
        let outcome = source.borrow_mut().transport_mut().start_tls(&domain);
        match outcome {
            Ok(TlsOutcome::Established) => self.finish_tls_handshake(),
            Ok(TlsOutcome::Retry) => true,
            Err(err) => {
                info!(
                    "Could not establish TLS handshake with {}: {err}",
                    server_and_port(&self.url)
                );
                self.state = State::Failure;
                false
            }
        }
    }

    fn run_tls_handshake(&mut self) -> bool {
        let source = match &self.source {
            Some(source) => Rc::clone(source),
            None => return false,
        };
        let outcome = source.borrow_mut().transport_mut().drive_tls();
        match outcome {
            Ok(TlsOutcome::Retry) => true,
            Ok(TlsOutcome::Established) => self.finish_tls_handshake(),
            Err(err) => {
                info!(
                    "Could not establish TLS handshake with {}: {err}",
                    server_and_port(&self.url)
                );
                self.state = State::Failure;
                false
            }
        }
    }

    /// The handshake has succeeded; verify the server is who we expect it to
    /// be before sending anything sensitive.
    fn finish_tls_handshake(&mut self) -> bool {
        let expected = self.client.expected_servers();
        if !expected.is_empty() {
            let subject = self
                .source
                .as_ref()
                .and_then(|s| s.borrow().transport().peer_subject());
            match subject {
                None => {
                    info!("No certificate subject was presented by server");
                    self.state = State::Failure;
                    return false;
                }
                Some(subject) => {
                    if !expected.iter().any(|e| e.is_subset_of(&subject)) {
                        info!("Server does not match any expected server");
                        self.state = State::Failure;
                        return false;
                    }
                    debug!(
                        "Server is {}",
                        subject.get("CN").unwrap_or_default()
                    );
                }
            }
        }
        self.state = State::Ready;
        false
    }

    fn run_ready(&mut self) -> bool {
        // If there's a request to be sent upstream, send it now.
        if !self.request_text.is_empty() && !self.http_send(RequestKind::Main) {
            return true;
        }
        self.state = State::RequestSent;
        false
    }

    fn run_request_sent(&mut self) -> bool {
        // Wait for the first line to come back from the server.
        let line = match self.http_getline() {
            LineOutcome::Line(line) => line,
            LineOutcome::Pending => return true,
            LineOutcome::Closed => {
                // The server hung up on us as soon as we tried to connect.
                if self.response_type == ResponseType::Hangup {
                    // Second immediate hangup in a row. Give up.
                    self.state = State::Failure;
                } else {
                    // Try again, once.
                    self.response_type = ResponseType::Hangup;
                }
                return true;
            }
        };

        if !self.parse_http_response(&line) {
            return false;
        }

        // The extra send headers have done their job; clear them for next
        // time.
        self.extra_headers.clear();

        self.state = State::ReadingHeader;
        self.current_field_name.clear();
        self.current_field_value.clear();
        self.headers.clear();
        self.file_size = 0;
        false
    }

    fn run_reading_header(&mut self) -> bool {
        if self.parse_http_header() {
            return true;
        }

        self.server_response_has_no_body = self.status_code / 100 == 1
            || self.status_code == 204
            || self.status_code == 304
            || self.method == Method::HEAD;

        // Look for key properties in the header fields.
        if self.status_code == 206 {
            let content_range = self.header_value("content-range");
            if content_range.is_empty() {
                warn!("Got 206 response without Content-Range header!");
                self.state = State::Failure;
                return false;
            }
            if !self.parse_content_range(&content_range) {
                warn!("Couldn't parse Content-Range: {content_range}");
                self.state = State::Failure;
                return false;
            }
        } else {
            self.first_byte = 0;
            self.last_byte = 0;
        }

        // In case we've got a download in effect, reset the download position
        // to match our starting byte.
        if !self.reset_download_position() {
            self.state = State::Failure;
            return false;
        }

        self.file_size = 0;
        let content_length = self.header_value("content-length");
        if !content_length.is_empty() {
            self.file_size = content_length.trim().parse().unwrap_or(0);
        } else if self.status_code == 206 {
            // No content-length from the server, but we can infer the byte
            // count from the range we were given.
            self.file_size = self.last_byte - self.first_byte + 1;
        }
        self.redirect = self.header_value("location");

        self.state = State::ReadHeader;

        if self.server_response_has_no_body && self.will_close_connection() {
            // If the server said it will close the connection, we should
            // close it too.
            self.close_connection();
        }

        // Handle automatic retries and redirects.
        let last_status = self.last_status_code;
        self.last_status_code = self.status_code;

        if self.status_code == 407 && last_status != 407 && self.proxy.is_some() {
            // Not authorized to proxy. Try to get the authorization.
            let challenge = self.header_value("proxy-authenticate");
            if let Some(proxy) = self.proxy.clone() {
                self.proxy_auth = self.client.generate_auth(&proxy, true, &challenge);
                if let Some(auth) = self.proxy_auth.clone() {
                    self.proxy_realm = auth.realm().to_string();
                    self.proxy_username = self
                        .client
                        .select_username(&proxy, true, &self.proxy_realm)
                        .unwrap_or_default();
                    if !self.proxy_username.is_empty() {
                        self.make_request_text();
                        // Roll the state forward to force a new request.
                        self.state = State::BeginBody;
                        return false;
                    }
                }
            }
        }

        if self.status_code == 401 && last_status != 401 {
            // Not authorized to remote server. Try to get the authorization.
            let challenge = self.header_value("www-authenticate");
            let url = self.url.clone();
            self.www_auth = self.client.generate_auth(&url, false, &challenge);
            if let Some(auth) = self.www_auth.clone() {
                self.www_realm = auth.realm().to_string();
                self.www_username = self
                    .client
                    .select_username(&url, false, &self.www_realm)
                    .unwrap_or_default();
                if !self.www_username.is_empty() {
                    self.make_request_text();
                    // Roll the state forward to force a new request.
                    self.state = State::BeginBody;
                    return false;
                }
            }
        }

        if self.status_code / 100 == 3 && self.status_code != 305 {
            // Redirect. Should we handle it automatically?
            if !self.redirect.is_empty()
                && (self.method == Method::GET || self.method == Method::HEAD)
            {
                let new_url = match self.url.join(&self.redirect) {
                    Ok(url) => url,
                    Err(err) => {
                        warn!("Invalid redirect to {}: {err}", self.redirect);
                        return false;
                    }
                };
                if !self.redirect_trail.insert(new_url.to_string()) {
                    warn!("cycle detected in redirect to {new_url}");
                } else {
                    debug!("following redirect to {new_url}");
                    let mut new_url = new_url;
                    if !self.url.username().is_empty() {
                        let username = self.url.username().to_string();
                        let _ = new_url.set_username(&username);
                    }
                    self.set_url(new_url);
                    self.make_header();
                    self.make_request_text();
                    // Roll the state forward to force a new request.
                    self.state = State::BeginBody;
                    return false;
                }
            }
        }

        false
    }

    /// The normal stopping point of a request. This state only exists so a
    /// request left here can be distinguished from one that must start
    /// skipping the previous body.
    fn run_read_header(&mut self) -> bool {
        self.state = State::BeginBody;
        false
    }

    fn run_begin_body(&mut self) -> bool {
        if self.will_close_connection() {
            // If the socket will close anyway, no point in skipping past the
            // previous body; just reset.
            self.reset_to_new();
            return false;
        }

        if self.server_response_has_no_body {
            // We have already "read" the nonexistent body.
            self.state = State::ReadTrailer;
        } else if self.file_size > MAX_SKIP_BYTES {
            debug!(
                "Dropping connection rather than skipping past {} bytes",
                self.file_size
            );
            self.reset_to_new();
        } else {
            debug_assert!(self.body_reader.is_none());
            match self.read_body() {
                Some(reader) => {
                    self.body_reader = Some(reader);
                    self.state = State::ReadingBody;
                }
                None => {
                    debug!("Unable to skip body");
                    self.reset_to_new();
                }
            }
        }

        false
    }

    /// Skips past a body the user chose not to read, so the connection can be
    /// reused for the next request.
    fn run_reading_body(&mut self) -> bool {
        if let Some(has_trailer) = self.body_signal.take() {
            // The body the user was reading has finished.
            self.body_reader = None;
            self.finished_body(has_trailer);
            return false;
        }

        if self.will_close_connection() {
            self.reset_to_new();
            return false;
        }

        let mut reader = match self.body_reader.take() {
            Some(reader) => reader,
            None => {
                // We're not in skip-body mode. Better reset.
                self.reset_to_new();
                return false;
            }
        };

        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(BodyRead::Data(n)) => {
                    trace!("skip: {n} bytes");
                }
                Ok(BodyRead::Pending) => {
                    // There's more to come later.
                    self.body_reader = Some(reader);
                    return true;
                }
                Ok(BodyRead::Finished) => {
                    let has_trailer = self.body_signal.take().unwrap_or(false);
                    self.finished_body(has_trailer);
                    return false;
                }
                Ok(BodyRead::Closed) => {
                    self.reset_to_new();
                    return false;
                }
                Err(err) => {
                    warn!("Error in response body: {err}");
                    self.state = State::Failure;
                    return false;
                }
            }
        }
    }

    /// Skips the trailer following the recently-read body.
    fn run_read_body(&mut self) -> bool {
        if self.will_close_connection() {
            self.reset_to_new();
            return false;
        }

        loop {
            match self.http_getline() {
                LineOutcome::Line(line) => {
                    if line.is_empty() {
                        break;
                    }
                }
                LineOutcome::Pending | LineOutcome::Closed => return true,
            }
        }

        self.state = State::ReadTrailer;
        false
    }

    /// Body and trailer are fully consumed; pass back through to ready.
    fn run_read_trailer(&mut self) -> bool {
        if self.will_close_connection() {
            self.reset_to_new();
            return false;
        }

        self.state = if self.proxy.is_some() && !self.proxy_tunnel {
            State::ProxyReady
        } else {
            State::Ready
        };
        false
    }

    /// Streams body bytes to the download destination, honoring the throttle
    /// quota in non-blocking mode.
    fn run_download(&mut self) -> bool {
        let do_throttle = self.nonblocking && self.config.download_throttle;
        let mut reader = match self.body_reader.take() {
            Some(reader) => reader,
            None => return false,
        };

        let mut buf = [0u8; 4096];
        let finished = loop {
            let cap = if do_throttle {
                let quota = self.bytes_requested.saturating_sub(self.bytes_downloaded);
                if quota == 0 {
                    // That's enough for now.
                    self.body_reader = Some(reader);
                    return true;
                }
                quota.min(buf.len())
            } else {
                buf.len()
            };

            match reader.read(&mut buf[..cap]) {
                Ok(BodyRead::Data(n)) => {
                    if let Err(err) = self.write_download(&buf[..n]) {
                        warn!("Error writing to {}: {err}", self.download_name());
                        self.state = State::Failure;
                        return false;
                    }
                    self.bytes_downloaded += n;
                }
                Ok(BodyRead::Pending) => {
                    // More to come.
                    self.body_reader = Some(reader);
                    return true;
                }
                Ok(BodyRead::Finished) => break true,
                Ok(BodyRead::Closed) => break false,
                Err(err) => {
                    warn!("Error in response body: {err}");
                    self.state = State::Failure;
                    return false;
                }
            }
        };

        if let DownloadDest::File { path, file } = &mut self.download_dest {
            if let Err(err) = file.flush() {
                warn!("Error writing to {}: {err}", path.display());
                self.state = State::Failure;
                return false;
            }
        }

        if finished {
            self.download_complete = true;
            if let Some(has_trailer) = self.body_signal.take() {
                self.finished_body(has_trailer);
            }
        }
        false
    }

    fn write_download(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.download_dest {
            DownloadDest::File { file, .. } => file.write_all(bytes),
            DownloadDest::Ram(ramfile) => {
                ramfile.borrow_mut().append(bytes);
                Ok(())
            }
            DownloadDest::None => Ok(()),
        }
    }

    fn download_name(&self) -> String {
        match &self.download_dest {
            DownloadDest::File { path, .. } => path.display().to_string(),
            DownloadDest::Ram(_) => "Ramfile".to_string(),
            DownloadDest::None => String::new(),
        }
    }

    /// Called by run() when the terminal state is reached; begins the
    /// download if one was requested.
    fn reached_done_state(&mut self) -> bool {
        trace!(
            "terminating run(), state = {:?}, done_state = {:?}",
            self.state,
            self.done_state
        );

        if self.state == State::Failure || matches!(self.download_dest, DownloadDest::None) {
            // All done.
            return false;
        }

        // We have to download the body now.
        match self.read_body() {
            None => {
                debug!("Unable to download body");
                false
            }
            Some(reader) => {
                self.body_reader = Some(reader);
                self.started_download = true;
                self.last_run_time = self.clock.now_seconds();
                true
            }
        }
    }

    /// Called when a body decoder reports completion; advances the state past
    /// the body. `has_trailer` means trailer lines still follow on the
    /// connection and must be skipped before it can be reused.
    fn finished_body(&mut self, has_trailer: bool) {
        if self.will_close_connection() && matches!(self.download_dest, DownloadDest::None) {
            self.reset_to_new();
        } else if has_trailer {
            self.state = State::ReadBody;
        } else {
            self.state = State::ReadTrailer;
        }
    }

    /// Reads a single line from the server's reply. On a closed connection
    /// the channel is reset so run() will reconnect and retry.
    fn http_getline(&mut self) -> LineOutcome {
        let source = match &self.source {
            Some(source) => Rc::clone(source),
            None => return LineOutcome::Closed,
        };
        let outcome = source.borrow_mut().read_line();
        if outcome == LineOutcome::Closed {
            debug!("Lost connection to server unexpectedly during read");
            self.reset_to_new();
        }
        outcome
    }

    /// Sends as much of the request text as the transport will take. Returns
    /// true once the buffer has been fully sent.
    fn http_send(&mut self, kind: RequestKind) -> bool {
        let source = match &self.source {
            Some(source) => Rc::clone(source),
            None => return false,
        };
        let result = {
            let text = match kind {
                RequestKind::Proxy => &self.proxy_request_text,
                RequestKind::Main => &self.request_text,
            };
            debug_assert!(text.len() > self.sent_so_far);
            let remaining = &text.as_bytes()[self.sent_so_far..];
            let result = source.borrow_mut().try_write(remaining);
            result.map(|wrote| (wrote, remaining.len()))
        };
        match result {
            Err(_) => {
                // The connection has been closed.
                debug!("Lost connection to server unexpectedly during write");
                self.reset_to_new();
                false
            }
            Ok((None, _)) => {
                // Temporary failure: the pipe is full. Wait till later.
                false
            }
            Ok((Some(wrote), remaining)) => {
                trace!("send: {wrote} of {remaining} bytes");
                if wrote < remaining {
                    self.sent_so_far += wrote;
                    false
                } else {
                    // Buffer completely sent.
                    self.sent_so_far = 0;
                    true
                }
            }
        }
    }

    /// Parses the first line sent back from the server or proxy, storing the
    /// version, status code, and reason string.
    fn parse_http_response(&mut self, line: &str) -> bool {
        if !line.starts_with("HTTP/") {
            // Not an HTTP response.
            self.status_code = 0;
            self.status_string = "Not an HTTP response".to_string();
            if self.response_type == ResponseType::NonHttp {
                // Second non-HTTP response in a row. Give up.
                self.state = State::Failure;
            } else {
                // Maybe we were just in some bad state. Drop the connection
                // and try again, once.
                self.reset_to_new();
                self.response_type = ResponseType::NonHttp;
            }
            return false;
        }

        self.response_type = ResponseType::Http;

        let mut parts = line.split_ascii_whitespace();
        let version = parts.next().unwrap_or_default();
        self.http_version_string = version.to_string();
        self.http_version = parse_http_version_string(version);

        let status_code = parts.next().unwrap_or_default();
        self.status_code = status_code.parse().unwrap_or(0);

        self.status_string = parts.collect::<Vec<_>>().join(" ");
        true
    }

    /// Reads the series of response header lines, accumulating them into the
    /// header table. Returns true while there is more to read.
    fn parse_http_header(&mut self) -> bool {
        let mut line = match self.http_getline() {
            LineOutcome::Line(line) => line,
            LineOutcome::Pending | LineOutcome::Closed => return true,
        };

        while !line.is_empty() {
            if line.as_bytes()[0].is_ascii_whitespace() {
                // A line beginning with whitespace continues the previous
                // field, folded with a single space.
                let p = line
                    .as_bytes()
                    .iter()
                    .position(|b| !b.is_ascii_whitespace())
                    .unwrap_or(line.len());
                self.current_field_value.push_str(&line[p - 1..]);
            } else {
                // Otherwise the line defines a new field.
                if !self.current_field_name.is_empty() {
                    let name = std::mem::take(&mut self.current_field_name);
                    let value = std::mem::take(&mut self.current_field_value);
                    self.store_header_field(name.clone(), value);
                    self.current_field_name = name;
                    self.current_field_value.clear();
                }

                if let Some((name, value)) = line.split_once(':') {
                    self.current_field_name = name.to_ascii_lowercase();
                    self.current_field_value = value.trim_start().to_string();
                }
            }

            line = match self.http_getline() {
                LineOutcome::Line(line) => line,
                LineOutcome::Pending | LineOutcome::Closed => return true,
            };
        }

        // After reading an empty line, we're done with the headers.
        if !self.current_field_name.is_empty() {
            let name = std::mem::take(&mut self.current_field_name);
            let value = std::mem::take(&mut self.current_field_value);
            self.store_header_field(name, value);
        }

        false
    }

    /// Stores one name: value pair, or appends to the existing value if the
    /// server repeated the header.
    fn store_header_field(&mut self, name: String, value: String) {
        use std::collections::btree_map::Entry;
        match self.headers.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.push_str(", ");
                existing.push_str(&value);
            }
        }
    }

    /// Interprets a `Content-Range` header, filling in the first and last
    /// byte positions if it can be understood.
    fn parse_content_range(&mut self, content_range: &str) -> bool {
        let mut parts = content_range.splitn(2, char::is_whitespace);
        let units = parts.next().unwrap_or_default();
        let range = parts.next().unwrap_or_default().trim_start();

        if units != "bytes" {
            return false;
        }
        let Some((first, rest)) = range.split_once('-') else {
            return false;
        };
        // The total-length suffix after '/' is ignored.
        let last = rest.split('/').next().unwrap_or_default();
        let (Ok(first_byte), Ok(last_byte)) =
            (first.trim().parse::<usize>(), last.trim().parse::<usize>())
        else {
            return false;
        };
        if last_byte < first_byte {
            return false;
        }
        self.first_byte = first_byte;
        self.last_byte = last_byte;
        true
    }

    /// Formats the request line and standing headers for the current method,
    /// URL, and body.
    fn make_header(&mut self) {
        if let Some(proxy) = self.proxy.clone() {
            self.proxy_auth = self.client.select_auth(&proxy, true, &self.proxy_realm);
            self.proxy_username.clear();
            if let Some(auth) = self.proxy_auth.clone() {
                self.proxy_realm = auth.realm().to_string();
                self.proxy_username = self
                    .client
                    .select_username(&proxy, true, &self.proxy_realm)
                    .unwrap_or_default();
            }
        }

        if self.method == Method::CONNECT {
            // No HTTP header at all; we'll just open a plain connection.
            // (When using a proxy, it's the proxy header we need instead.)
            self.header.clear();
            return;
        }

        let url = self.url.clone();
        self.www_auth = self.client.select_auth(&url, false, &self.www_realm);
        self.www_username.clear();
        if let Some(auth) = self.www_auth.clone() {
            self.www_realm = auth.realm().to_string();
            self.www_username = self
                .client
                .select_username(&url, false, &self.www_realm)
                .unwrap_or_default();
        }

        let request_path = if self.proxy_serves_document {
            // Asking the proxy for the document requires its full URL, minus
            // the username, which is information just for us.
            let mut url = self.url.clone();
            let _ = url.set_username("");
            url.set_fragment(None);
            url.to_string()
        } else {
            // Asking the server directly just takes the path.
            full_path(&self.url)
        };

        let mut header = format!(
            "{} {} {}\r\n",
            self.method,
            request_path,
            http_version_string(self.client.http_version())
        );

        if self.client.http_version() >= Version::HTTP_11 {
            header.push_str(&format!(
                "Host: {}\r\n",
                self.url.host_str().unwrap_or_default()
            ));
            if !self.persistent_connection {
                header.push_str("Connection: close\r\n");
            }
        }

        if self.last_byte != 0 {
            header.push_str(&format!(
                "Range: bytes={}-{}\r\n",
                self.first_byte, self.last_byte
            ));
        } else if self.first_byte != 0 {
            header.push_str(&format!("Range: bytes={}-\r\n", self.first_byte));
        }

        if !self.body.is_empty() {
            header.push_str(&format!(
                "Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n",
                self.body.len()
            ));
        }

        self.header = header;
    }

    /// Builds the special request sent directly to the proxy to open a
    /// tunnel, separate from the request tailored for the server.
    fn make_proxy_request_text(&mut self) {
        self.proxy_request_text = self.proxy_header.clone();

        if let Some(auth) = &self.proxy_auth {
            if !self.proxy_username.is_empty() {
                self.proxy_request_text.push_str("Proxy-Authorization: ");
                self.proxy_request_text.push_str(&auth.generate(
                    &Method::CONNECT,
                    &server_and_port(&self.url),
                    &self.proxy_username,
                    &self.body,
                ));
                self.proxy_request_text.push_str("\r\n");
            }
        }

        self.proxy_request_text.push_str("\r\n");
    }

    /// Builds the specific request text that will be sent to the server this
    /// pass, based on the current header and body.
    fn make_request_text(&mut self) {
        self.request_text = self.header.clone();
        if self.request_text.is_empty() {
            // A connect request sends no request text.
            return;
        }

        if self.proxy.is_some() && !self.proxy_tunnel {
            if let Some(auth) = &self.proxy_auth {
                if !self.proxy_username.is_empty() {
                    self.request_text.push_str("Proxy-Authorization: ");
                    self.request_text.push_str(&auth.generate(
                        &self.method,
                        self.url.as_str(),
                        &self.proxy_username,
                        &self.body,
                    ));
                    self.request_text.push_str("\r\n");
                }
            }
        }

        if let Some(auth) = &self.www_auth {
            if !self.www_username.is_empty() {
                self.request_text.push_str("Authorization: ");
                self.request_text.push_str(&auth.generate(
                    &self.method,
                    &full_path(&self.url),
                    &self.www_username,
                    &self.body,
                ));
                self.request_text.push_str("\r\n");
            }
        }

        self.request_text.push_str(&self.extra_headers);
        self.request_text.push_str("\r\n");
        self.request_text.push_str(&self.body);
    }

    /// Changes the document URL, dropping the connection if the new URL
    /// cannot be served over it.
    fn set_url(&mut self, url: Url) {
        // Switching between http and https always resets the connection.
        // Otherwise a change of server or port resets it, unless we're
        // talking through a proxy.
        if url.scheme() != self.url.scheme()
            || (self.proxy.is_none()
                && (url.host_str() != self.url.host_str() || url_port(&url) != url_port(&self.url)))
        {
            self.reset_to_new();
        }
        self.url = url;
    }

    /// Seeks the download destination to the starting byte of a resumed
    /// subdocument, truncating or rewinding as appropriate. Returns false if
    /// the starting position is invalid.
    fn reset_download_position(&mut self) -> bool {
        if self.subdocument_resumes {
            match &mut self.download_dest {
                DownloadDest::File { path, file } => {
                    // Seeking past the end would silently extend the file
                    // with zero bytes, so check the length ourselves.
                    let len = match file.seek(SeekFrom::End(0)) {
                        Ok(len) => len,
                        Err(err) => {
                            info!("Could not seek within {}: {err}", path.display());
                            return false;
                        }
                    };
                    if self.first_byte as u64 > len {
                        info!(
                            "Invalid starting position of byte {} within {} (which has {len} bytes)",
                            self.first_byte,
                            path.display()
                        );
                        return false;
                    }
                    if let Err(err) = file.seek(SeekFrom::Start(self.first_byte as u64)) {
                        info!("Could not seek within {}: {err}", path.display());
                        return false;
                    }
                }
                DownloadDest::Ram(ramfile) => {
                    let mut ram = ramfile.borrow_mut();
                    if self.first_byte > ram.len() {
                        info!(
                            "Invalid starting position of byte {} within Ramfile (which has {} bytes)",
                            self.first_byte,
                            ram.len()
                        );
                        return false;
                    }
                    if self.first_byte == 0 {
                        ram.clear();
                    } else {
                        ram.truncate(self.first_byte);
                    }
                }
                DownloadDest::None => {}
            }
        } else {
            // Without resuming, always start at the beginning of the file,
            // regardless of the requested range.
            match &mut self.download_dest {
                DownloadDest::File { file, .. } => {
                    if file.seek(SeekFrom::Start(0)).is_err() {
                        return false;
                    }
                }
                DownloadDest::Ram(ramfile) => ramfile.borrow_mut().clear(),
                DownloadDest::None => {}
            }
        }

        true
    }

    fn reset_for_new_request(&mut self) {
        self.reset_download_to();
        self.last_status_code = 0;
        self.response_type = ResponseType::None;
        self.redirect_trail.clear();
        self.bytes_downloaded = 0;
        self.bytes_requested = 0;
    }

    /// Forgets how the document was to be downloaded. This must be
    /// re-specified after each request.
    fn reset_download_to(&mut self) {
        self.started_download = false;
        self.download_complete = false;
        self.download_dest = DownloadDest::None;
    }

    /// Closes the connection and resets the state to new.
    fn reset_to_new(&mut self) {
        self.close_connection();
        self.state = State::New;
    }

    /// Closes the connection but leaves the state unchanged.
    fn close_connection(&mut self) {
        self.body_reader = None;
        self.source = None;
        self.sent_so_far = 0;
        self.proxy_tunnel = false;
    }
}

/// The query-preserving path of a URL, as sent in a request line.
fn full_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn parse_http_version_string(version: &str) -> Version {
    match version {
        "HTTP/0.9" => Version::HTTP_09,
        "HTTP/1.0" => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::DocClient;
    use crate::mock::{MockScript, MockTransport};

    fn channel() -> HttpChannel {
        HttpChannel::new(Rc::new(DocClient::new()))
    }

    fn channel_with_source(
        script: &Rc<RefCell<MockScript>>,
    ) -> HttpChannel {
        let mut ch = channel();
        ch.source = Some(Rc::new(RefCell::new(ConnectionStream::new(Box::new(
            MockTransport::new(script.clone()),
        )))));
        ch
    }

    #[test]
    fn parse_response_splits_version_code_reason() {
        let mut ch = channel();
        assert!(ch.parse_http_response("HTTP/1.1 404 Not Found"));
        assert_eq!(ch.status_code(), 404);
        assert_eq!(ch.status_string(), "Not Found");
        assert_eq!(ch.http_version_string(), "HTTP/1.1");
        assert_eq!(ch.http_version(), Version::HTTP_11);

        assert!(ch.parse_http_response("HTTP/1.0 200 OK"));
        assert_eq!(ch.http_version(), Version::HTTP_10);
    }

    #[test]
    fn non_http_response_retries_once_then_fails() {
        let mut ch = channel();
        assert!(!ch.parse_http_response("SSH-2.0-OpenSSH_8.9"));
        assert_eq!(ch.status_code(), 0);
        assert_eq!(ch.status_string(), "Not an HTTP response");
        assert_eq!(ch.state, State::New);

        assert!(!ch.parse_http_response("still not http"));
        assert_eq!(ch.state, State::Failure);
    }

    #[test]
    fn header_folding_keeps_one_space() {
        let script = MockScript::new();
        script
            .borrow_mut()
            .push_read(b"Foo: bar\r\n  baz\r\nOther: x\r\n\r\n");
        let mut ch = channel_with_source(&script);
        assert!(!ch.parse_http_header());
        assert_eq!(ch.header_value("Foo"), "bar baz");
        assert_eq!(ch.header_value("other"), "x");
    }

    #[test]
    fn repeated_headers_are_joined_with_comma() {
        let script = MockScript::new();
        script
            .borrow_mut()
            .push_read(b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n");
        let mut ch = channel_with_source(&script);
        assert!(!ch.parse_http_header());
        assert_eq!(ch.header_value("set-cookie"), "a=1, b=2");
    }

    #[test]
    fn header_parse_resumes_across_pending_reads() {
        let script = MockScript::new();
        script.borrow_mut().push_read(b"Content-Le");
        let mut ch = channel_with_source(&script);
        assert!(ch.parse_http_header());
        script.borrow_mut().push_read(b"ngth: 42\r\n\r\n");
        assert!(!ch.parse_http_header());
        assert_eq!(ch.header_value("content-length"), "42");
    }

    #[test]
    fn content_range_accepts_only_sane_byte_ranges() {
        let mut ch = channel();
        assert!(ch.parse_content_range("bytes 500-999/1234"));
        assert_eq!(ch.first_byte(), 500);
        assert_eq!(ch.last_byte(), 999);

        assert!(ch.parse_content_range("bytes 0-0"));
        assert!(!ch.parse_content_range("bytes 900-500/1234"));
        assert!(!ch.parse_content_range("chapters 1-2"));
        assert!(!ch.parse_content_range("bytes */1234"));
    }

    #[test]
    fn will_close_connection_honors_version_and_header() {
        let mut ch = channel();
        ch.http_version = Version::HTTP_10;
        assert!(ch.will_close_connection());

        ch.http_version = Version::HTTP_11;
        assert!(!ch.will_close_connection());

        ch.store_header_field("connection".to_string(), "Close".to_string());
        assert!(ch.will_close_connection());
    }

    #[test]
    fn request_header_includes_host_and_range() {
        let mut ch = channel();
        ch.begin_request(
            Method::GET,
            Url::parse("http://www.example.com/a/b.txt").unwrap(),
            "",
            true,
            100,
            199,
        );
        assert!(ch.request_text.starts_with("GET /a/b.txt HTTP/1.1\r\n"));
        assert!(ch.request_text.contains("Host: www.example.com\r\n"));
        assert!(ch.request_text.contains("Connection: close\r\n"));
        assert!(ch.request_text.contains("Range: bytes=100-199\r\n"));
        assert!(ch.request_text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn post_request_carries_form_body() {
        let mut ch = channel();
        ch.begin_request(
            Method::POST,
            Url::parse("http://www.example.com/submit").unwrap(),
            "name=value",
            true,
            0,
            0,
        );
        assert!(ch.request_text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(ch
            .request_text
            .contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(ch.request_text.contains("Content-Length: 10\r\n"));
        assert!(ch.request_text.ends_with("\r\n\r\nname=value"));
    }

    #[test]
    fn connect_request_has_no_request_text() {
        let mut ch = channel();
        ch.begin_request(
            Method::CONNECT,
            Url::parse("http://www.example.com:5432/").unwrap(),
            "",
            true,
            0,
            0,
        );
        assert!(ch.request_text.is_empty());
        assert_eq!(ch.done_state, State::Ready);
    }

    #[test]
    fn set_url_resets_connection_only_when_it_must() {
        let script = MockScript::new();
        let mut ch = channel_with_source(&script);
        ch.url = Url::parse("http://www.example.com/one").unwrap();

        // same server, same port: connection survives
        ch.set_url(Url::parse("http://www.example.com/two").unwrap());
        assert!(ch.source.is_some());

        // different server: connection dropped
        ch.set_url(Url::parse("http://other.example.com/two").unwrap());
        assert!(ch.source.is_none());
    }

    #[test]
    fn extra_headers_are_sent_once() {
        let mut ch = channel();
        ch.send_extra_header("X-Custom", "yes");
        ch.begin_request(
            Method::GET,
            Url::parse("http://www.example.com/").unwrap(),
            "",
            true,
            0,
            0,
        );
        assert!(ch.request_text.contains("X-Custom: yes\r\n"));
    }
}
