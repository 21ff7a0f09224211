// =============================================================================
// Bearer token authentication for the gateway
// =============================================================================
//
// Expected tokens come from the environment (`MERIDIAN_USER_TOKEN`,
// `MERIDIAN_ADMIN_TOKEN`); a connection presents its token as a `?token=`
// query parameter or an `Authorization: Bearer` header. Comparison is
// constant time. A token matching neither variable rejects the connection
// with close code 4401.
// =============================================================================

use tracing::warn;

use crate::gateway::acl::Role;

pub const USER_TOKEN_ENV: &str = "MERIDIAN_USER_TOKEN";
pub const ADMIN_TOKEN_ENV: &str = "MERIDIAN_ADMIN_TOKEN";

/// Compare two byte slices in constant time. Every byte is examined even
/// after a mismatch so timing reveals nothing about the position.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Resolve a presented token to a role, checking admin first.
pub fn resolve_role(token: &str) -> Option<Role> {
    if token.is_empty() {
        return None;
    }

    let admin = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
    if !admin.is_empty() && constant_time_eq(token.as_bytes(), admin.as_bytes()) {
        return Some(Role::Admin);
    }

    let user = std::env::var(USER_TOKEN_ENV).unwrap_or_default();
    if !user.is_empty() && constant_time_eq(token.as_bytes(), user.as_bytes()) {
        return Some(Role::User);
    }

    if admin.is_empty() && user.is_empty() {
        warn!("no gateway tokens configured -- every connection will be rejected");
    }
    None
}

/// Pull the bearer token out of an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}
