//! Credentials for node authentication
//!
//! When credentials are configured, a freshly opened connection sends an
//! `AuthReq` with the user name and password and waits for `AuthResp` before
//! it is handed to callers. The password never appears in `Debug` or
//! `Display` output.
//!
//! # Example
//!
//! ```
//! use strata_common::auth::Credentials;
//!
//! let creds = Credentials::new("riak", "secret");
//! assert_eq!(creds.username(), "riak");
//! assert!(creds.verify("riak", "secret"));
//! assert!(!format!("{}", creds).contains("secret"));
//! ```

use std::fmt;

use crate::protocol::AuthRequest;

/// User name and password presented to a node.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Checks a user/password pair against these credentials.
    ///
    /// Used by fake nodes in tests. Comparison runs in constant time with
    /// respect to the content of equal-length inputs.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        // Evaluate both halves so a wrong user name costs the same as a wrong password
        let user_ok = constant_time_eq(&self.username, username);
        let pass_ok = constant_time_eq(&self.password, password);
        user_ok & pass_ok
    }

    /// Builds the `AuthReq` body for these credentials.
    pub fn to_request(&self) -> AuthRequest {
        AuthRequest {
            user: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:***", self.username)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}
