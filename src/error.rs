use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Transport failure that outlived the retry budget. Handled like
    /// [`Error::Api`]: the device is skipped and the batch continues.
    Http(reqwest::Error),
    /// Token refresh failed, or the upstream kept answering 401 after a refresh.
    Auth(String),
    /// Call rejected locally because authentication is flagged as broken.
    AuthBroken,
    RateLimited { path: String },
    /// Generic upstream failure: exhausted 5xx retries or an unclassified 4xx.
    Api { status: u16, message: String },
    /// Upstream payload did not have the expected shape.
    Decode(String),
    UnknownDevice(String),
    UnknownProgram(u32),
    InvalidOption { name: &'static str, value: String },
    Config(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl Error {
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::AuthBroken)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    /// Failures that affect every call on the account, not just one device.
    pub fn is_account_wide(&self) -> bool {
        self.is_auth() || self.is_rate_limited()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Auth(msg) => write!(f, "authentication error: {msg}"),
            Error::AuthBroken => write!(f, "authentication is broken, refusing to call upstream"),
            Error::RateLimited { path } => write!(f, "rate limited (429) on {path}"),
            Error::Api { status, message } => write!(f, "API error {status}: {message}"),
            Error::Decode(msg) => write!(f, "malformed payload: {msg}"),
            Error::UnknownDevice(id) => write!(f, "unknown device: {id}"),
            Error::UnknownProgram(n) => write!(f, "unknown program: {n}"),
            Error::InvalidOption { name, value } => write!(f, "invalid value for {name}: {value}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
