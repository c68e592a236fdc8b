use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

/// The header block of one HTTP message, independent of the wire protocol.
///
/// Request and response pseudo fields (`:method`, `:path`, `:authority`, `:scheme`,
/// `:status`) are typed; everything else is a regular field in an [`HeaderMap`]. On
/// HTTP/1.1 the authority travels as the `host` field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    method: Option<Method>,
    path: Option<String>,
    authority: Option<String>,
    scheme: Option<String>,
    status: Option<StatusCode>,
    fields: HeaderMap,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(method: Method, path: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            method: Some(method),
            path: Some(path.into()),
            authority: Some(authority.into()),
            ..Self::default()
        }
    }

    pub fn response(status: StatusCode) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.fields.append(name, value);
        self
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn set_authority(&mut self, authority: impl Into<String>) {
        self.authority = Some(authority.into());
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = Some(scheme.into());
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut HeaderMap {
        &mut self.fields
    }

    pub fn get(&self, name: impl header::AsHeaderName) -> Option<&HeaderValue> {
        self.fields.get(name)
    }

    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        self.fields.insert(name, value);
    }

    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.fields.append(name, value);
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// The `content-length` field, if present and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.fields.get(header::CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
    }

    /// True if `connection: close` was sent.
    pub fn connection_close(&self) -> bool {
        self.fields
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
    }
}
