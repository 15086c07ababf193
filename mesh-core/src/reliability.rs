//! Message reliability: retry with flood fallback, ack correlation, duplicate suppression and
//! clock consensus over inbound timestamps.
//!
//! Pure state machine. Callers put packets on air and report timeouts; this module only decides.

use crate::clock::{ClockSync, ClockSyncOutcome, RtcClock};
use crate::contacts::ContactRecord;
use crate::dedup::RecentMessageCache;
use crate::integrity::{ack_token, channel_message_hash, direct_message_hash};
use crate::packet::{GroupText, TextMessage, PUB_KEY_SIZE};

pub const MAX_SEND_ATTEMPTS: u8 = 3;
pub const RETRY_FALLBACK_ATTEMPT: u8 = 2;
/// Longest text accepted for sending, in bytes.
pub const MAX_TEXT_LEN: usize = 155;

const TIMEOUT_BASE_MS: u32 = 500;
const FLOOD_AIRTIME_FACTOR: u32 = 16;
const DIRECT_AIRTIME_FACTOR: u32 = 6;
const DIRECT_HOP_MS: u32 = 250;

/// Ack wait for a flooded packet.
pub fn flood_timeout_ms(airtime_ms: u32) -> u32 {
    TIMEOUT_BASE_MS.saturating_add(FLOOD_AIRTIME_FACTOR.saturating_mul(airtime_ms))
}

/// Ack wait for a packet sent along a `path_len` hop path.
pub fn direct_timeout_ms(airtime_ms: u32, path_len: usize) -> u32 {
    let per_hop = DIRECT_AIRTIME_FACTOR
        .saturating_mul(airtime_ms)
        .saturating_add(DIRECT_HOP_MS);
    let hops = u32::try_from(path_len).unwrap_or(u32::MAX).saturating_add(1);
    TIMEOUT_BASE_MS.saturating_add(per_hop.saturating_mul(hops))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    /// From this attempt on, retries ignore the known path and flood.
    pub fallback_attempt: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SEND_ATTEMPTS,
            fallback_attempt: RETRY_FALLBACK_ATTEMPT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Direct(Vec<u8>),
    Flood,
}

impl Delivery {
    fn for_contact(contact: &ContactRecord) -> Self {
        match &contact.out_path {
            Some(path) => Delivery::Direct(path.clone()),
            None => Delivery::Flood,
        }
    }

    pub fn timeout_ms(&self, airtime_ms: u32) -> u32 {
        match self {
            Delivery::Direct(path) => direct_timeout_ms(airtime_ms, path.len()),
            Delivery::Flood => flood_timeout_ms(airtime_ms),
        }
    }
}

/// The single outstanding reliable send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub recipient: [u8; PUB_KEY_SIZE],
    pub text: String,
    pub timestamp: u32,
    pub attempt: u8,
    pub expected_ack: u32,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    NoSend,
    Sending { attempt: u8 },
    Acked,
    GaveUp,
}

/// A text message ready to be put on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundText {
    pub recipient: [u8; PUB_KEY_SIZE],
    pub delivery: Delivery,
    pub message: TextMessage,
    pub ack_token: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Retry(OutboundText),
    GaveUp { recipient: [u8; PUB_KEY_SIZE], text: String },
    NoPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Matched { recipient: [u8; PUB_KEY_SIZE], attempt: u8 },
    /// Second copy of the ack that already completed the send.
    AlreadyAcked,
    Unknown,
}

/// What to do with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundVerdict {
    pub deliver: bool,
    /// Token to echo back, for direct messages.
    pub ack_token: Option<u32>,
    pub clock: ClockSyncOutcome,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message text is empty")]
    EmptyText,
    #[error("message text of {0} bytes is too long")]
    TextTooLong(usize),
}

pub struct ReliableMessenger {
    policy: RetryPolicy,
    self_pub: [u8; PUB_KEY_SIZE],
    state: SendState,
    pending: Option<PendingSend>,
    last_acked: Option<u32>,
    seen: RecentMessageCache,
    clock_sync: ClockSync,
}

impl ReliableMessenger {
    pub fn new(self_pub: [u8; PUB_KEY_SIZE], policy: RetryPolicy) -> Self {
        Self {
            policy,
            self_pub,
            state: SendState::NoSend,
            pending: None,
            last_acked: None,
            seen: RecentMessageCache::new(),
            clock_sync: ClockSync::new(),
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingSend> {
        self.pending.as_ref()
    }

    /// Start a reliable send, replacing any send still in flight.
    pub fn send(
        &mut self,
        contact: &ContactRecord,
        text: &str,
        timestamp: u32,
    ) -> Result<OutboundText, SendError> {
        if text.is_empty() {
            return Err(SendError::EmptyText);
        }
        if text.len() > MAX_TEXT_LEN {
            return Err(SendError::TextTooLong(text.len()));
        }
        if let Some(old) = &self.pending {
            tracing::debug!(attempt = old.attempt, "pending send superseded");
        }

        let pending = PendingSend {
            recipient: contact.public_key,
            text: text.to_owned(),
            timestamp,
            attempt: 0,
            expected_ack: ack_token(timestamp, 0, text, &self.self_pub),
            delivery: Delivery::for_contact(contact),
        };
        let out = self.outbound(&pending);
        self.state = SendState::Sending { attempt: 0 };
        self.pending = Some(pending);
        Ok(out)
    }

    /// Ack wait expired. `contact` is the recipient's record; its path is dropped on fallback.
    pub fn on_send_timeout(&mut self, contact: Option<&mut ContactRecord>) -> TimeoutOutcome {
        let Some(mut pending) = self.pending.take() else {
            return TimeoutOutcome::NoPending;
        };

        if pending.attempt >= self.policy.max_attempts {
            tracing::info!(attempts = pending.attempt + 1, "send failed, giving up");
            self.state = SendState::GaveUp;
            return TimeoutOutcome::GaveUp {
                recipient: pending.recipient,
                text: pending.text,
            };
        }

        pending.attempt += 1;
        if pending.attempt >= self.policy.fallback_attempt {
            if let Some(contact) = contact {
                if contact.out_path.is_some() {
                    tracing::debug!(attempt = pending.attempt, "falling back to flood");
                }
                contact.reset_path();
            }
            pending.delivery = Delivery::Flood;
        }
        pending.expected_ack =
            ack_token(pending.timestamp, pending.attempt, &pending.text, &self.self_pub);

        let out = self.outbound(&pending);
        self.state = SendState::Sending {
            attempt: pending.attempt,
        };
        self.pending = Some(pending);
        TimeoutOutcome::Retry(out)
    }

    pub fn on_ack(&mut self, token: u32) -> AckOutcome {
        match &self.pending {
            Some(p) if p.expected_ack == token => {
                let outcome = AckOutcome::Matched {
                    recipient: p.recipient,
                    attempt: p.attempt,
                };
                self.pending = None;
                self.state = SendState::Acked;
                self.last_acked = Some(token);
                outcome
            }
            _ if self.last_acked == Some(token) => AckOutcome::AlreadyAcked,
            _ => AckOutcome::Unknown,
        }
    }

    /// Inbound direct message from `sender`. Always yields the ack token, even for duplicates.
    pub fn on_direct_message(
        &mut self,
        sender: &[u8; PUB_KEY_SIZE],
        msg: &TextMessage,
        clock: &mut impl RtcClock,
    ) -> InboundVerdict {
        let hash = direct_message_hash(msg.timestamp, sender, &msg.text);
        let (deliver, clock_outcome) = self.admit(hash, msg.timestamp, clock);
        InboundVerdict {
            deliver,
            ack_token: Some(ack_token(msg.timestamp, msg.attempt, &msg.text, sender)),
            clock: clock_outcome,
        }
    }

    pub fn on_channel_message(
        &mut self,
        msg: &GroupText,
        clock: &mut impl RtcClock,
    ) -> InboundVerdict {
        let hash = channel_message_hash(msg.timestamp, msg.channel_hash, &msg.text);
        let (deliver, clock_outcome) = self.admit(hash, msg.timestamp, clock);
        InboundVerdict {
            deliver,
            ack_token: None,
            clock: clock_outcome,
        }
    }

    /// Record a message we originated so an echo of it is not delivered back to us.
    pub fn mark_seen(&mut self, hash: u32, now: u32) {
        self.seen.check_and_insert(hash, now);
    }

    /// Timestamps carried by other traffic (adverts) vote on the clock too.
    pub fn observe_timestamp(&mut self, timestamp: u32, clock: &mut impl RtcClock) -> ClockSyncOutcome {
        self.clock_sync.observe(timestamp, clock)
    }

    fn admit(
        &mut self,
        hash: u32,
        timestamp: u32,
        clock: &mut impl RtcClock,
    ) -> (bool, ClockSyncOutcome) {
        // Every copy votes on the clock, relayed duplicates included.
        let now = clock.current_time();
        let clock_outcome = self.clock_sync.observe(timestamp, clock);
        if self.seen.check_and_insert(hash, now) {
            tracing::debug!(hash, "duplicate message suppressed");
            return (false, clock_outcome);
        }
        (true, clock_outcome)
    }

    fn outbound(&self, pending: &PendingSend) -> OutboundText {
        OutboundText {
            recipient: pending.recipient,
            delivery: pending.delivery.clone(),
            message: TextMessage {
                dest_hash: pending.recipient[0],
                src_hash: self.self_pub[0],
                timestamp: pending.timestamp,
                attempt: pending.attempt,
                text: pending.text.clone(),
            },
            ack_token: pending.expected_ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DEDUP_WINDOW_SECS;
    use crate::test_support::ManualClock;

    const ME: [u8; 32] = [0x11; 32];
    const PEER: [u8; 32] = [0x22; 32];
    const T: u32 = 1_700_000_000;

    fn peer_with_path() -> ContactRecord {
        let mut c = ContactRecord::new(PEER, "peer");
        c.set_path(vec![5, 6]).unwrap();
        c
    }

    fn messenger() -> ReliableMessenger {
        ReliableMessenger::new(ME, RetryPolicy::default())
    }

    #[test]
    fn send_uses_known_path() {
        let mut m = messenger();
        let out = m.send(&peer_with_path(), "hi", T).unwrap();
        assert_eq!(out.delivery, Delivery::Direct(vec![5, 6]));
        assert_eq!(out.ack_token, ack_token(T, 0, "hi", &ME));
        assert_eq!(out.message.dest_hash, 0x22);
        assert_eq!(m.state(), SendState::Sending { attempt: 0 });

        let out = m.send(&ContactRecord::new(PEER, "peer"), "hi", T).unwrap();
        assert_eq!(out.delivery, Delivery::Flood);
    }

    #[test]
    fn rejects_bad_text() {
        let mut m = messenger();
        assert_eq!(m.send(&peer_with_path(), "", T), Err(SendError::EmptyText));
        let long = "x".repeat(MAX_TEXT_LEN + 1);
        assert_eq!(
            m.send(&peer_with_path(), &long, T),
            Err(SendError::TextTooLong(MAX_TEXT_LEN + 1))
        );
        assert_eq!(m.state(), SendState::NoSend);
        assert!(m.pending().is_none());
    }

    #[test]
    fn retries_fall_back_to_flood_then_give_up() {
        let mut m = messenger();
        let mut contact = peer_with_path();
        m.send(&contact, "hello", T).unwrap();

        let TimeoutOutcome::Retry(first) = m.on_send_timeout(Some(&mut contact)) else {
            panic!("expected retry");
        };
        assert_eq!(first.delivery, Delivery::Direct(vec![5, 6]));
        assert_eq!(first.message.attempt, 1);
        assert!(contact.out_path.is_some());

        let TimeoutOutcome::Retry(second) = m.on_send_timeout(Some(&mut contact)) else {
            panic!("expected retry");
        };
        assert_eq!(second.delivery, Delivery::Flood);
        assert!(contact.out_path.is_none());
        assert_eq!(second.ack_token, ack_token(T, 2, "hello", &ME));

        let TimeoutOutcome::Retry(third) = m.on_send_timeout(Some(&mut contact)) else {
            panic!("expected retry");
        };
        assert_eq!(third.message.attempt, MAX_SEND_ATTEMPTS);
        assert_eq!(third.delivery, Delivery::Flood);

        assert_eq!(
            m.on_send_timeout(Some(&mut contact)),
            TimeoutOutcome::GaveUp {
                recipient: PEER,
                text: "hello".into()
            }
        );
        assert_eq!(m.state(), SendState::GaveUp);
        assert_eq!(m.on_send_timeout(None), TimeoutOutcome::NoPending);
    }

    #[test]
    fn ack_is_idempotent() {
        let mut m = messenger();
        let out = m.send(&peer_with_path(), "yo", T).unwrap();
        assert_eq!(m.on_ack(0xDEAD), AckOutcome::Unknown);
        assert_eq!(
            m.on_ack(out.ack_token),
            AckOutcome::Matched {
                recipient: PEER,
                attempt: 0
            }
        );
        assert_eq!(m.state(), SendState::Acked);
        assert_eq!(m.on_ack(out.ack_token), AckOutcome::AlreadyAcked);
        assert_eq!(m.state(), SendState::Acked);
    }

    #[test]
    fn ack_must_match_latest_attempt() {
        let mut m = messenger();
        let mut contact = peer_with_path();
        let first = m.send(&contact, "yo", T).unwrap();
        let TimeoutOutcome::Retry(retry) = m.on_send_timeout(Some(&mut contact)) else {
            panic!("expected retry");
        };
        assert_ne!(first.ack_token, retry.ack_token);
        assert_eq!(m.on_ack(first.ack_token), AckOutcome::Unknown);
        assert!(matches!(m.on_ack(retry.ack_token), AckOutcome::Matched { attempt: 1, .. }));
    }

    #[test]
    fn duplicate_delivered_once_but_acked_twice() {
        let mut m = messenger();
        let mut clock = ManualClock::at(T);
        let msg = TextMessage {
            dest_hash: ME[0],
            src_hash: PEER[0],
            timestamp: T - 10,
            attempt: 0,
            text: "ping".into(),
        };
        let first = m.on_direct_message(&PEER, &msg, &mut clock);
        assert!(first.deliver);
        let again = m.on_direct_message(&PEER, &msg, &mut clock);
        assert!(!again.deliver);
        assert_eq!(again.ack_token, first.ack_token);
        assert_eq!(first.ack_token, Some(ack_token(T - 10, 0, "ping", &PEER)));

        clock.now += DEDUP_WINDOW_SECS;
        assert!(m.on_direct_message(&PEER, &msg, &mut clock).deliver);
    }

    #[test]
    fn relayed_copies_vote_on_clock() {
        let mut m = messenger();
        let mut clock = ManualClock::at(T);
        let msg = TextMessage {
            dest_hash: ME[0],
            src_hash: PEER[0],
            timestamp: T + 500,
            attempt: 0,
            text: "relayed".into(),
        };
        let verdicts: Vec<_> = (0..3)
            .map(|_| m.on_direct_message(&PEER, &msg, &mut clock))
            .collect();
        assert_eq!(
            verdicts.iter().map(|v| v.deliver).collect::<Vec<_>>(),
            vec![true, false, false]
        );
        assert_eq!(verdicts[1].clock, ClockSyncOutcome::Sampled);
        assert_eq!(
            verdicts[2].clock,
            ClockSyncOutcome::Adjusted {
                from: T,
                to: T + 500
            }
        );
        assert_eq!(clock.now, T + 500);
    }

    #[test]
    fn channel_dedup_keyed_on_channel() {
        let mut m = messenger();
        let mut clock = ManualClock::at(T);
        let mut msg = GroupText {
            channel_hash: 1,
            timestamp: T,
            flags: 0,
            text: "bob: hi".into(),
        };
        assert!(m.on_channel_message(&msg, &mut clock).deliver);
        assert!(!m.on_channel_message(&msg, &mut clock).deliver);
        msg.channel_hash = 2;
        let v = m.on_channel_message(&msg, &mut clock);
        assert!(v.deliver);
        assert_eq!(v.ack_token, None);
    }

    #[test]
    fn inbound_timestamps_drive_clock() {
        let mut m = messenger();
        let mut clock = ManualClock::at(T - 50);
        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            let msg = TextMessage {
                dest_hash: ME[0],
                src_hash: PEER[0],
                timestamp: T + i as u32,
                attempt: 0,
                text: (*text).into(),
            };
            m.on_direct_message(&PEER, &msg, &mut clock);
        }
        assert_eq!(clock.now, T + 1);
    }

    #[test]
    fn timeout_formulas() {
        assert_eq!(flood_timeout_ms(100), 500 + 1600);
        assert_eq!(direct_timeout_ms(100, 2), 500 + (600 + 250) * 3);
        assert_eq!(Delivery::Direct(vec![]).timeout_ms(100), 500 + 850);
        assert_eq!(flood_timeout_ms(u32::MAX), u32::MAX);
    }
}
