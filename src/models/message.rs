//! A unit of queued work: the canonical path of a payload awaiting its next
//! stage.

use sqlx::FromRow;

/// A dequeued work message.
///
/// The message stays invisible to other consumers until its visibility
/// timeout expires; acknowledging it requires the `pop_receipt` handed out at
/// dequeue time, so a consumer that lost its claim cannot delete a message
/// that has since been re-delivered elsewhere.
#[derive(Debug, Clone, FromRow)]
pub struct WorkMessage {
    /// Stable message id, assigned at enqueue.
    pub id: String,
    /// Claim token for this delivery. Rotates on every dequeue.
    pub pop_receipt: String,
    /// Canonical payload path.
    pub body: String,
    /// How many times this message has been delivered, this one included.
    pub dequeue_count: i64,
}
