//! Incoming HTTP request type.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, header};

/// An incoming HTTP request with its body fully read.
///
/// Form values are decoded once, when the request is constructed: the query
/// string always, and the body too when it is
/// `application/x-www-form-urlencoded`.
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    form: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        let form = decode_form(&uri, &headers, &body);
        Self { method, uri, headers, body, form }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Header lookup. Values that are not valid UTF-8 are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Appends a header value. Middleware uses this to pass data inward.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    /// Returns the form value for `key`.
    ///
    /// A key submitted several times yields its values concatenated in
    /// submission order. `None` means the key was not submitted at all; an
    /// empty string means it was submitted empty.
    pub fn form_value(&self, key: &str) -> Option<String> {
        let mut found = false;
        let mut out = String::new();
        for (k, v) in &self.form {
            if k == key {
                found = true;
                out.push_str(v);
            }
        }
        found.then_some(out)
    }

    /// Returns the form values for every key in `keys`, in the same order.
    ///
    /// `None` if any one of them is missing.
    pub fn form_values(&self, keys: &[&str]) -> Option<Vec<String>> {
        keys.iter().map(|k| self.form_value(k)).collect()
    }

    #[cfg(test)]
    pub(crate) fn get(uri: &str) -> Self {
        Self::new(Method::GET, uri.parse().unwrap_or_default(), HeaderMap::new(), Bytes::new())
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts.method, parts.uri, parts.headers, body)
    }
}

/// Malformed input decodes to an empty form rather than failing the request.
fn decode_form(uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = uri
        .query()
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default();

    let urlencoded = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if urlencoded {
        if let Ok(pairs) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
            form.extend(pairs);
        }
    }
    form
}
