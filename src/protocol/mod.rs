pub mod clientmsg;
pub mod codec;
pub mod key;
pub mod workermsg;

/// Opaque correlation token carried in the `queue` field of messages that
/// expect a reply. Allocated by the reply table, never reused.
pub type RequestId = u64;
