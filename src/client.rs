//! Client-wide policy shared by every channel: proxy, HTTP version,
//! TLS settings, and credentials.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use http::Version;
use log::debug;
use url::Url;

use crate::auth::{self, Authorization};
use crate::transport::{PeerSubject, TcpTransport, Transport, VerifyMode};

/// The request-line token for an HTTP version.
pub fn http_version_string(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Policy and shared services a [`crate::channel::HttpChannel`] consults while
/// it runs. One context is typically shared by many channels.
pub trait ClientContext {
    /// The proxy all document requests should be routed through, if any.
    fn proxy(&self) -> Option<Url>;

    /// The HTTP version spoken in outgoing requests.
    fn http_version(&self) -> Version;

    /// Opens a fresh transport toward `host:port`.
    fn open_transport(
        &self,
        host: &str,
        port: u16,
        nonblocking: bool,
    ) -> io::Result<Box<dyn Transport>>;

    fn verify_mode(&self) -> VerifyMode {
        VerifyMode::Strict
    }

    /// Certificate subjects the server is required to match one of. Empty
    /// means any verified server is acceptable.
    fn expected_servers(&self) -> Vec<PeerSubject> {
        Vec::new()
    }

    /// Returns a previously established authorization for this URL, if one is
    /// cached from an earlier challenge.
    fn select_auth(&self, url: &Url, is_proxy: bool, last_realm: &str)
        -> Option<Rc<dyn Authorization>>;

    /// Builds an authorization from a `WWW-Authenticate` or
    /// `Proxy-Authenticate` challenge and caches it for later requests.
    fn generate_auth(&self, url: &Url, is_proxy: bool, challenge: &str)
        -> Option<Rc<dyn Authorization>>;

    /// Looks up the `user:password` credential on file for this URL and realm.
    fn select_username(&self, url: &Url, is_proxy: bool, realm: &str) -> Option<String>;
}

/// Default [`ClientContext`]: explicit proxy configuration and a credential
/// table keyed by server and realm.
pub struct DocClient {
    proxy: Option<Url>,
    http_version: Version,
    verify: VerifyMode,
    expected_servers: Vec<PeerSubject>,
    /// Extra PEM root certificates trusted for TLS.
    root_certs: Option<String>,
    /// Keyed `server:port/realm`, with the server or realm part empty as a
    /// wildcard.
    usernames: BTreeMap<String, String>,
    auth_cache: RefCell<BTreeMap<String, Rc<dyn Authorization>>>,
}

impl DocClient {
    pub fn new() -> Self {
        Self {
            proxy: None,
            http_version: Version::HTTP_11,
            verify: VerifyMode::Strict,
            expected_servers: Vec::new(),
            root_certs: None,
            usernames: BTreeMap::new(),
            auth_cache: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn set_proxy(&mut self, proxy: Option<Url>) {
        self.proxy = proxy;
    }

    pub fn set_http_version(&mut self, version: Version) {
        self.http_version = version;
    }

    pub fn set_verify_mode(&mut self, verify: VerifyMode) {
        self.verify = verify;
    }

    pub fn add_expected_server(&mut self, subject: PeerSubject) {
        self.expected_servers.push(subject);
    }

    pub fn set_root_certs(&mut self, pem: Option<String>) {
        self.root_certs = pem;
    }

    /// Registers a `user:password` credential. Empty `server` applies to any
    /// server, empty `realm` to any realm; `server` should include the port,
    /// e.g. `www.example.com:80`.
    pub fn set_username(&mut self, server: &str, realm: &str, username: &str) {
        self.usernames
            .insert(format!("{server}/{realm}"), username.to_string());
    }

    fn auth_key(url: &Url, is_proxy: bool) -> String {
        let kind = if is_proxy { "proxy" } else { "www" };
        format!("{}:{}", kind, server_and_port(url))
    }
}

impl Default for DocClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientContext for DocClient {
    fn proxy(&self) -> Option<Url> {
        self.proxy.clone()
    }

    fn http_version(&self) -> Version {
        self.http_version
    }

    fn open_transport(
        &self,
        host: &str,
        port: u16,
        nonblocking: bool,
    ) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::connect(
            host,
            port,
            nonblocking,
            self.root_certs.clone(),
            self.verify,
        )?))
    }

    fn verify_mode(&self) -> VerifyMode {
        self.verify
    }

    fn expected_servers(&self) -> Vec<PeerSubject> {
        self.expected_servers.clone()
    }

    fn select_auth(
        &self,
        url: &Url,
        is_proxy: bool,
        _last_realm: &str,
    ) -> Option<Rc<dyn Authorization>> {
        self.auth_cache
            .borrow()
            .get(&Self::auth_key(url, is_proxy))
            .cloned()
    }

    fn generate_auth(
        &self,
        url: &Url,
        is_proxy: bool,
        challenge: &str,
    ) -> Option<Rc<dyn Authorization>> {
        let schemes = auth::parse_authentication_schemes(challenge);
        let authorization = auth::make_authorization(&schemes);
        if authorization.is_none() {
            debug!("no supported authentication mechanism in challenge: {challenge}");
        }
        if let Some(authorization) = &authorization {
            self.auth_cache
                .borrow_mut()
                .insert(Self::auth_key(url, is_proxy), Rc::clone(authorization));
        }
        authorization
    }

    fn select_username(&self, url: &Url, _is_proxy: bool, realm: &str) -> Option<String> {
        let server = server_and_port(url);
        for key in [
            format!("{server}/{realm}"),
            format!("{server}/"),
            format!("/{realm}"),
            String::from("/"),
        ] {
            if let Some(username) = self.usernames.get(&key) {
                return Some(username.clone());
            }
        }
        None
    }
}

/// `host:port` for a URL, filling in the scheme's default port.
pub fn server_and_port(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url_port(url)
    )
}

/// The explicit or scheme-default port of a URL.
pub fn url_port(url: &Url) -> u16 {
    url.port_or_known_default().unwrap_or(80)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn username_lookup_prefers_most_specific_key() {
        let mut client = DocClient::new();
        client.set_username("", "", "any:any");
        client.set_username("", "secrets", "realm:pw");
        client.set_username("www.example.com:80", "", "server:pw");
        client.set_username("www.example.com:80", "secrets", "exact:pw");

        let url = Url::parse("http://www.example.com/index.html").unwrap();
        assert_eq!(
            client.select_username(&url, false, "secrets").unwrap(),
            "exact:pw"
        );
        assert_eq!(
            client.select_username(&url, false, "other").unwrap(),
            "server:pw"
        );

        let other = Url::parse("http://other.example.com/").unwrap();
        assert_eq!(
            client.select_username(&other, false, "secrets").unwrap(),
            "realm:pw"
        );
        assert_eq!(
            client.select_username(&other, false, "x").unwrap(),
            "any:any"
        );
    }

    #[test]
    fn generated_auth_is_cached_for_reuse() {
        let client = DocClient::new();
        let url = Url::parse("http://www.example.com/").unwrap();
        assert!(client.select_auth(&url, false, "").is_none());

        let auth = client
            .generate_auth(&url, false, "Basic realm=\"vault\"")
            .unwrap();
        assert_eq!(auth.realm(), "vault");

        let cached = client.select_auth(&url, false, "vault").unwrap();
        assert_eq!(cached.realm(), "vault");
        // proxy and www challenges are cached independently
        assert!(client.select_auth(&url, true, "vault").is_none());
    }

    #[test]
    fn server_and_port_uses_scheme_default() {
        let url = Url::parse("https://www.example.com/x").unwrap();
        assert_eq!(server_and_port(&url), "www.example.com:443");
        let url = Url::parse("http://www.example.com:8080/").unwrap();
        assert_eq!(server_and_port(&url), "www.example.com:8080");
    }
}
