use crate::serdes::{SerdesError, WireReader, WireWriter};

/// Status codes carried in an auth response. Everything other than
/// [`SUCCESS`] is a failure, but [`TRYING_NEXT_PORT`] style codes are
/// advisory ("still in progress") rather than terminal.
pub mod auth_codes {
    /// Authentication succeeded.
    pub const SUCCESS: &str = "success";
    /// The connection on the current port failed; another port remains to be
    /// tried. Non-terminal: the caller should keep waiting, not re-logon.
    pub const TRYING_NEXT_PORT: &str = "m.trying_next_port";
    /// The server refused the session because it is at capacity.
    pub const SERVER_OVERLOADED: &str = "m.server_overloaded";
    /// The supplied credentials were rejected.
    pub const INVALID_CREDENTIALS: &str = "m.invalid_credentials";
    /// The client version is too old for this server.
    pub const VERSION_MISMATCH: &str = "m.version_mismatch";
    /// Catch-all failure.
    pub const SERVER_ERROR: &str = "m.server_error";
    /// The connection could not be established or died before the session
    /// went live.
    pub const NETWORK_ERROR: &str = "m.network_error";
}

/// Credentials presented at auth time. A public key configures the optional
/// secure-channel exchange prior to authentication; without one the client
/// goes straight to plain auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Server public key, if this client should request a secure channel.
    pub public_key: Option<Vec<u8>>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            public_key: None,
        }
    }

    pub fn with_public_key(mut self, key: Vec<u8>) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn requires_secure(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn ser(&self, writer: &mut WireWriter) {
        writer.write_string(&self.username);
        writer.write_string(&self.password);
    }

    pub fn de(reader: &mut WireReader) -> Result<Self, SerdesError> {
        Ok(Self {
            username: reader.read_string()?,
            password: reader.read_string()?,
            public_key: None,
        })
    }
}

/// The data portion of an auth response: a status code plus opaque extra
/// payload that applications may layer their own information into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponseData {
    pub code: String,
    pub extra: Vec<u8>,
}

impl AuthResponseData {
    pub fn success() -> Self {
        Self {
            code: auth_codes::SUCCESS.to_string(),
            extra: Vec::new(),
        }
    }

    pub fn failure(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            extra: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == auth_codes::SUCCESS
    }

    pub fn ser(&self, writer: &mut WireWriter) {
        writer.write_string(&self.code);
        writer.write_bytes(&self.extra);
    }

    pub fn de(reader: &mut WireReader) -> Result<Self, SerdesError> {
        Ok(Self {
            code: reader.read_string()?,
            extra: reader.read_bytes()?,
        })
    }
}
