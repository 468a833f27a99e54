// cache-core/src/coordinator/protocol.rs

//! Wire format of the reader/writer lock protocol.
//!
//! A client opens one WebSocket connection per lock hold. The request path
//! names the resource and the `read_lock` query parameter selects the mode:
//!
//! ```text
//! GET /<storage_type>/<bucket>/<cache_path>?read_lock=True
//! ```
//!
//! Once the lock is granted the server sends a single text frame holding the
//! grant token for the mode. The lock is held until the connection closes.

use std::fmt;

/// Query parameter selecting the lock mode.
pub const READ_LOCK_PARAM: &str = "read_lock";

pub const READ_LOCK_GRANTED: &str = "read_lock_granted";
pub const WRITE_LOCK_GRANTED: &str = "write_lock_granted";

/// Lock mode of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    /// Token the server sends when the lock is granted.
    pub fn grant_token(self) -> &'static str {
        match self {
            Self::Read => READ_LOCK_GRANTED,
            Self::Write => WRITE_LOCK_GRANTED,
        }
    }

    /// `read_lock=<value>` query string for this mode.
    pub fn query(self) -> String {
        let value = match self {
            Self::Read => "True",
            Self::Write => "False",
        };
        format!("{READ_LOCK_PARAM}={value}")
    }

    /// Extracts the mode from a raw query string; `None` when the parameter
    /// is missing or not a boolean.
    pub fn from_query(query: Option<&str>) -> Option<Self> {
        let value = query?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == READ_LOCK_PARAM).then_some(value)
        })?;
        if value.eq_ignore_ascii_case("true") {
            Some(Self::Read)
        } else if value.eq_ignore_ascii_case("false") {
            Some(Self::Write)
        } else {
            None
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Identity of one lockable resource.
///
/// Components are used verbatim in the request path, so they must not need
/// URL escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockResource {
    pub storage_type: String,
    pub bucket: String,
    pub cache_path: String,
}

impl LockResource {
    pub fn new(
        storage_type: impl Into<String>,
        bucket: impl Into<String>,
        cache_path: impl Into<String>,
    ) -> Self {
        Self {
            storage_type: storage_type.into(),
            bucket: bucket.into(),
            cache_path: cache_path.into(),
        }
    }

    /// Request path, starting with `/`.
    pub fn path(&self) -> String {
        format!(
            "/{}/{}/{}",
            self.storage_type,
            self.bucket.trim_matches('/'),
            self.cache_path.trim_start_matches('/')
        )
    }

    /// Path and query for a request in `mode`.
    pub fn request_target(&self, mode: LockMode) -> String {
        format!("{}?{}", self.path(), mode.query())
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Key under which the server tracks the lock for a request path.
pub fn resource_key(path: &str) -> &str {
    path.trim_start_matches('/')
}
