//! Protocol versioning against the coordinating service.

/// Client protocol version reported in the authenticate message.
///
/// The coordinating service uses this to gate features and to decide
/// whether a gateway is too old to serve. Bump only when the remote
/// service has deployed support for the new value.
pub const CLIENT_VERSION: u32 = 1;
