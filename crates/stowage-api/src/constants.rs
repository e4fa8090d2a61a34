/// Prefix of every API route.
pub const API_PREFIX: &str = "/api";

/// Header carrying the caller's identity (`u_…` for users, `i_…` for integrations).
/// Authentication happens upstream; this service trusts the value.
pub const IDENTITY_HEADER: &str = "x-stowage-identity";

/// Headroom on top of the largest brokered body for framing and proxies.
pub const BODY_LIMIT_SLACK_BYTES: usize = 64 * 1024;
