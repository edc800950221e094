use std::fmt;

use serde::{Deserialize, Serialize};

pub type Identity = String;

/// Fixed prefix that marks a referral token.
pub const TOKEN_PREFIX: &str = "ref_";

/// Path segment that carries the token inside a referral link.
pub const LINK_SEGMENT: &str = "/ref/";

/// Opaque referral token, `ref_` followed by the full referrer identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ReferralToken(String);

impl ReferralToken {
    pub fn for_identity(identity: &str) -> Self {
        Self(format!("{TOKEN_PREFIX}{identity}"))
    }

    /// Accepts only the recognized token shape; anything else is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let identity = raw.strip_prefix(TOKEN_PREFIX)?;
        if identity.is_empty() {
            return None;
        }
        if identity.chars().any(|c| c.is_whitespace() || c == '/') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn referrer_identity(&self) -> &str {
        &self.0[TOKEN_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferralToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn referral_link(origin: &str, token: &ReferralToken) -> String {
    format!("{}{}{}", origin.trim_end_matches('/'), LINK_SEGMENT, token)
}

/// Extracts the token from an inbound link. Hash routes (`/#/ref/...`)
/// match as well since they contain the same segment.
pub fn token_from_link(url: &str) -> Option<ReferralToken> {
    let start = url.rfind(LINK_SEGMENT)? + LINK_SEGMENT.len();
    let rest = &url[start..];
    let end = rest.find(['?', '#', '/']).unwrap_or(rest.len());
    ReferralToken::parse(&rest[..end])
}
