//! Messaging core of a peer-to-peer chat client: a lightweight reliability layer on top of UDP.
//!
//! Every datagram carries exactly one textual frame:
//!
//! ```ascii
//! <sequence id>|<kind>|<payload>
//! ```
//!
//! * `sequence id` is a decimal u64. Application messages (`text`) are numbered per peer,
//!    starting at 1 without gaps. Control frames carry 0.
//! * `kind` is one of `text`, `request`, `keep_alive` and `unavailable`
//! * `payload` is everything after the second delimiter. It may contain `|` and need not be
//!    UTF-8 (e.g. if it is encrypted)
//!
//! The receiver of a `text` frame accepts it if it has the next expected id, drops it if it was
//!  seen before, and otherwise sends a `request` for the first missing id. Missing frames are
//!  filled in one at a time: frames after a gap are *not* buffered but requested again once the
//!  gap is closed. The sender keeps a bounded number of sent frames per peer for re-sending, and
//!  replies with `unavailable` if a requested frame is gone so the requester can skip it.
//!
//! `keep_alive` frames are sent periodically to all registered peers. They are not sequenced and
//!  serve only to track liveness.
//!
//! This is explicitly *not* a full transport protocol: there is no congestion or flow control,
//!  no fragmentation, and no ordering guarantees beyond single-gap recovery.

pub mod config;
pub mod messaging;
pub mod util;
pub mod test_util;
