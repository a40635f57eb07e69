//! Validated primitive types shared across the router, scheduler, gateway,
//! and bridge modules.
//!
//! Every identifier or bounded numeric value that crosses a module boundary
//! is wrapped here so a raw, unchecked `String`/`u64` can never stand in for
//! it by accident.

use nutype::nutype;

/// A chat transport name, e.g. `"telegram"`. Never empty.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct ChannelName(String);

/// Opaque chat identifier as supplied by a channel adapter.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct ChatId(String);

/// Opaque user identifier as supplied by a channel adapter.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct UserId(String);

/// An 8-character scheduled-task identifier.
#[nutype(
    validate(len_char_min = 8, len_char_max = 8),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct TaskId(String);

/// A conversational thread identifier, e.g. `"telegram_100_s2"`.
#[nutype(
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)
)]
pub struct ThreadId(String);

/// Scheduler poll-cycle delay in seconds, clamped to be at least 1.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)
)]
pub struct PollIntervalSecs(u64);

/// A gateway subprocess timeout in seconds, already clamped to `[0, 600]`
/// per the gateway's validation pipeline (`0` means "no limit").
#[nutype(
    validate(less_or_equal = 600),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)
)]
pub struct GatewayTimeoutSecs(u64);

/// A per-(channel, chat) session-reset counter. Monotonically non-decreasing.
#[nutype(
    default = 0,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Default
    )
)]
pub struct ResetCount(u64);

impl ResetCount {
    /// Returns the next counter value after an explicit reset.
    #[must_use]
    pub fn incremented(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// Computes the thread id for a (channel, chat_id) pair at a given reset
/// counter, per the router's session-identity rule: no suffix at counter 0,
/// `_sN` otherwise.
#[must_use]
pub fn thread_id_for(channel: &ChannelName, chat_id: &ChatId, counter: ResetCount) -> ThreadId {
    let base = format!("{channel}_{chat_id}");
    let raw = if counter.into_inner() == 0 {
        base
    } else {
        format!("{base}_s{}", counter.into_inner())
    };
    ThreadId::try_new(raw).expect("channel_chatid composition is never empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_has_no_suffix_at_zero() {
        let channel = ChannelName::try_new("telegram").unwrap();
        let chat = ChatId::try_new("100").unwrap();
        assert_eq!(
            thread_id_for(&channel, &chat, ResetCount::new(0)).into_inner(),
            "telegram_100"
        );
    }

    #[test]
    fn thread_id_has_suffix_above_zero() {
        let channel = ChannelName::try_new("telegram").unwrap();
        let chat = ChatId::try_new("100").unwrap();
        assert_eq!(
            thread_id_for(&channel, &chat, ResetCount::new(1)).into_inner(),
            "telegram_100_s1"
        );
    }

    #[test]
    fn reset_count_increments() {
        let c = ResetCount::new(3);
        assert_eq!(c.incremented().into_inner(), 4);
    }

    #[test]
    fn gateway_timeout_rejects_above_600() {
        assert!(GatewayTimeoutSecs::try_new(601).is_err());
        assert!(GatewayTimeoutSecs::try_new(600).is_ok());
    }
}
