use crate::error::ProtocolError;
use crate::protocol::{AuthMethod, Version};

/// AuthRequest holds the methods a client offered in its greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub suggested_methods: Vec<AuthMethod>,
}

/// AuthRequest implementation block
impl AuthRequest {
    /// decode parses a client greeting from the front of a buffer and returns it
    /// together with the number of bytes it occupied
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        // ClientHello format
        // +----+----------+----------+
        // |VER | NMETHODS | METHODS  |
        // +----+----------+----------+
        // | 1  |    1     | 1 to 255 |
        // +----+----------+----------+

        if buf.is_empty() {
            return Err(ProtocolError::Incomplete);
        }

        // Ensure version is 0x05 -> SOCKS5
        if buf[0] != Version::SOCKS5 as u8 {
            return Err(ProtocolError::UnsupportedVersion(buf[0]));
        }

        if buf.len() < 2 {
            return Err(ProtocolError::Incomplete);
        }

        let n_methods = buf[1] as usize;
        let len = 2 + n_methods;
        if buf.len() < len {
            return Err(ProtocolError::Incomplete);
        }

        // Methods we have no name for can never be chosen, drop them here
        let suggested_methods = buf[2..len]
            .iter()
            .filter_map(|&byte| AuthMethod::from_byte(byte))
            .collect();

        Ok((Self { suggested_methods }, len))
    }

    /// choose_method returns the method the server will use for this client
    pub fn choose_method(&self) -> AuthMethod {
        select_auth_method(&self.suggested_methods)
    }
}

/// select_auth_method walks the server's preference list and returns the
/// first method the client also offered
pub fn select_auth_method(client_methods: &[AuthMethod]) -> AuthMethod {
    // Preferred auth method order: no credentials are ever checked
    const PREFERRED_METHODS: &[AuthMethod] = &[AuthMethod::NoAuth];

    for &preferred in PREFERRED_METHODS {
        if client_methods.contains(&preferred) {
            return preferred;
        }
    }

    AuthMethod::NoAcceptable
}

/// encode_method_choice builds the server's method selection reply
pub fn encode_method_choice(method: AuthMethod) -> [u8; 2] {
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    [Version::SOCKS5 as u8, method as u8]
}
