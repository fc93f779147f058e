//! HTTP authentication: challenge parsing and credential generation.

use std::collections::BTreeMap;
use std::rc::Rc;

use base64::prelude::{Engine, BASE64_STANDARD};
use http::Method;

/// Parameters of a single authentication challenge, keyed by lowercased token
/// name. The scheme name itself is recorded under the pseudo-token `""`.
pub type Tokens = BTreeMap<String, String>;

/// All challenges offered in a `WWW-Authenticate` or `Proxy-Authenticate`
/// header, keyed by lowercased scheme name.
pub type AuthenticationSchemes = BTreeMap<String, Tokens>;

/// Generates `Authorization` header values for one mechanism and realm.
pub trait Authorization {
    fn mechanism(&self) -> &str;

    fn realm(&self) -> &str;

    /// Returns the full header value for a request, e.g. `Basic dXNlcjpwdw==`.
    /// `username` carries the credential in `user:password` form.
    fn generate(&self, method: &Method, request_path: &str, username: &str, body: &str) -> String;
}

/// The Basic mechanism: credentials are sent base64-encoded with every request.
#[derive(Debug)]
pub struct BasicAuthorization {
    realm: String,
}

impl BasicAuthorization {
    pub fn new(tokens: &Tokens) -> Self {
        Self {
            realm: tokens.get("realm").cloned().unwrap_or_default(),
        }
    }
}

impl Authorization for BasicAuthorization {
    fn mechanism(&self) -> &str {
        "basic"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn generate(&self, _method: &Method, _request_path: &str, username: &str, _body: &str) -> String {
        format!("Basic {}", BASE64_STANDARD.encode(username))
    }
}

/// Parses the value of a `WWW-Authenticate` or `Proxy-Authenticate` header into
/// its challenges.
///
/// The grammar is loose on purpose: a bare word opens a new scheme, while a
/// `token=value` pair (value optionally quoted) is attached to the scheme most
/// recently opened. Scheme and token names are lowercased; a trailing comma on
/// a token name is dropped.
pub fn parse_authentication_schemes(field_value: &str) -> AuthenticationSchemes {
    let mut schemes = AuthenticationSchemes::new();
    let mut current: Option<String> = None;

    let bytes = field_value.as_bytes();
    let mut p = 0;
    while p < bytes.len() {
        while p < bytes.len() && bytes[p].is_ascii_whitespace() {
            p += 1;
        }
        if p >= bytes.len() {
            break;
        }
        let start = p;
        while p < bytes.len() && !bytes[p].is_ascii_whitespace() && bytes[p] != b'=' {
            p += 1;
        }
        let mut word = field_value[start..p].to_ascii_lowercase();
        if p < bytes.len() && bytes[p] == b'=' {
            p += 1;
            let value = scan_quoted_or_unquoted_string(field_value, &mut p);
            if word.ends_with(',') {
                word.pop();
            }
            let scheme = current.get_or_insert_with(String::new);
            schemes
                .entry(scheme.clone())
                .or_default()
                .insert(word, value);
        } else {
            if word.ends_with(',') {
                word.pop();
            }
            if !word.is_empty() {
                schemes
                    .entry(word.clone())
                    .or_default()
                    .insert(String::new(), word.clone());
                current = Some(word);
            }
        }
    }

    schemes
}

/// Scans a string that may or may not be quoted, starting at `*p`, and leaves
/// `*p` one past its end (past any trailing comma for unquoted values).
fn scan_quoted_or_unquoted_string(source: &str, p: &mut usize) -> String {
    let bytes = source.as_bytes();
    let mut result = String::new();

    if *p < bytes.len() && bytes[*p] == b'"' {
        *p += 1;
        while *p < bytes.len() && bytes[*p] != b'"' {
            if bytes[*p] == b'\\' && *p + 1 < bytes.len() {
                *p += 1;
            }
            result.push(bytes[*p] as char);
            *p += 1;
        }
        if *p < bytes.len() {
            *p += 1; // closing quote
        }
    } else {
        while *p < bytes.len() && !bytes[*p].is_ascii_whitespace() && bytes[*p] != b',' {
            result.push(bytes[*p] as char);
            *p += 1;
        }
        if *p < bytes.len() && bytes[*p] == b',' {
            *p += 1;
        }
    }

    result
}

/// Picks a supported mechanism from parsed challenges, strongest first.
pub fn make_authorization(schemes: &AuthenticationSchemes) -> Option<Rc<dyn Authorization>> {
    schemes
        .get("basic")
        .map(|tokens| Rc::new(BasicAuthorization::new(tokens)) as Rc<dyn Authorization>)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_single_basic_challenge() {
        let schemes = parse_authentication_schemes("Basic realm=\"Secure Area\"");
        let basic = schemes.get("basic").unwrap();
        assert_eq!(basic.get("realm").unwrap(), "Secure Area");
    }

    #[test]
    fn parse_multiple_schemes() {
        let schemes = parse_authentication_schemes(
            "Digest realm=\"x\", nonce=\"abc123\", Basic realm=unquoted",
        );
        assert_eq!(schemes.len(), 2);
        assert_eq!(schemes.get("digest").unwrap().get("nonce").unwrap(), "abc123");
        assert_eq!(schemes.get("basic").unwrap().get("realm").unwrap(), "unquoted");
    }

    #[test]
    fn quoted_value_keeps_commas_and_escapes() {
        let schemes = parse_authentication_schemes("Basic realm=\"a, \\\"b\\\", c\"");
        assert_eq!(
            schemes.get("basic").unwrap().get("realm").unwrap(),
            "a, \"b\", c"
        );
    }

    #[test]
    fn basic_generate_encodes_credentials() {
        let schemes = parse_authentication_schemes("Basic realm=\"r\"");
        let auth = make_authorization(&schemes).unwrap();
        assert_eq!(auth.mechanism(), "basic");
        assert_eq!(auth.realm(), "r");
        let value = auth.generate(&Method::GET, "/", "Aladdin:open sesame", "");
        assert_eq!(value, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn unsupported_scheme_yields_none() {
        let schemes = parse_authentication_schemes("Negotiate");
        assert!(make_authorization(&schemes).is_none());
    }
}
