//! Pluggable authentication for the security negotiation stage
//!
//! RFC 3720 Section 5.3.2. The target offers one method through the
//! `AuthMethod` key; the exchange that follows is driven one login PDU at a
//! time through [`AuthExchange::step`]. Only the `None` method is built in.

use std::fmt;

/// Outcome of one security negotiation exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// More rounds needed; answer with these keys
    Continue(Vec<(String, String)>),
    /// Initiator authenticated; answer with these keys
    Complete(Vec<(String, String)>),
    /// Login must fail with an authentication failure
    Failed(String),
}

/// Per-connection state of one authentication exchange
pub trait AuthExchange: Send {
    /// Process the keys of one login request in the security stage
    fn step(&mut self, params: &[(String, String)]) -> AuthStep;
}

/// An authentication method the target can offer
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Value for the AuthMethod key
    fn method(&self) -> &str;

    /// Fresh exchange for a new connection
    fn exchange(&self) -> Box<dyn AuthExchange>;

    /// Whether the initiator may skip security negotiation
    fn allows_skip(&self) -> bool {
        false
    }

    /// Choose our method from an offered list such as `CHAP,None`
    fn select(&self, offered: &str) -> Option<String> {
        offered
            .split(',')
            .map(str::trim)
            .find(|m| *m == self.method())
            .map(str::to_string)
    }
}

/// The `None` authentication method
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthentication;

struct NoExchange;

impl AuthExchange for NoExchange {
    fn step(&mut self, _params: &[(String, String)]) -> AuthStep {
        AuthStep::Complete(Vec::new())
    }
}

impl Authenticator for NoAuthentication {
    fn method(&self) -> &str {
        "None"
    }

    fn exchange(&self) -> Box<dyn AuthExchange> {
        Box::new(NoExchange)
    }

    fn allows_skip(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_method() {
        let auth = NoAuthentication;
        assert_eq!(auth.method(), "None");
        assert!(auth.allows_skip());
        assert_eq!(auth.exchange().step(&[]), AuthStep::Complete(vec![]));
    }

    #[test]
    fn test_select_from_offer() {
        let auth = NoAuthentication;
        assert_eq!(auth.select("CHAP, None").as_deref(), Some("None"));
        assert_eq!(auth.select("CHAP"), None);
    }
}
