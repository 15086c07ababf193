//! A chat node: radio, reliability, contacts and clock composed behind one poll loop.

use crate::clock::{set_clock_manually, ClockError, ClockSyncOutcome, RtcClock};
use crate::contacts::{ContactBook, ContactRecord, StoreError};
use crate::dispatcher::{DispatchError, Dispatcher, ReceivedFrame};
use crate::identity::{self, LocalIdentity};
use crate::integrity::{channel_hash, channel_message_hash, PUBLIC_CHANNEL_PSK};
use crate::packet::{
    decode_ack, encode_ack, Advert, GroupText, Packet, PacketError, PayloadType, RouteType,
    TextMessage, PUB_KEY_SIZE,
};
use crate::radio::Transceiver;
use crate::reliability::{
    flood_timeout_ms, AckOutcome, Delivery, OutboundText, ReliableMessenger, RetryPolicy, SendError,
    TimeoutOutcome, MAX_TEXT_LEN,
};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    MessageReceived {
        from: [u8; PUB_KEY_SIZE],
        name: String,
        text: String,
        timestamp: u32,
    },
    ChannelMessage {
        text: String,
        timestamp: u32,
    },
    Delivered {
        recipient: [u8; PUB_KEY_SIZE],
        attempt: u8,
    },
    SendFailed {
        recipient: [u8; PUB_KEY_SIZE],
        text: String,
    },
    ContactHeard {
        public_key: [u8; PUB_KEY_SIZE],
        name: String,
    },
    ClockAdjusted {
        from: u32,
        to: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("no contact with that key")]
    UnknownContact,
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Node<T: Transceiver, C: RtcClock> {
    dispatcher: Dispatcher<T>,
    messenger: ReliableMessenger,
    identity: LocalIdentity,
    clock: C,
    contacts: ContactBook,
    name: String,
    channel: u8,
    /// Text waiting in the dispatcher queue; its ack timer starts once it is on air.
    awaiting_tx: Option<QueuedText>,
    ack_deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct QueuedText {
    ticket: u64,
    timeout_ms: u32,
}

impl<T: Transceiver, C: RtcClock> Node<T, C> {
    pub fn new(
        dispatcher: Dispatcher<T>,
        identity: LocalIdentity,
        clock: C,
        contacts: ContactBook,
        name: impl Into<String>,
    ) -> Self {
        let messenger = ReliableMessenger::new(identity.public_key(), RetryPolicy::default());
        Self {
            dispatcher,
            messenger,
            identity,
            clock,
            contacts,
            name: name.into(),
            channel: channel_hash(&PUBLIC_CHANNEL_PSK),
            awaiting_tx: None,
            ack_deadline_ms: None,
        }
    }

    pub fn public_key(&self) -> [u8; PUB_KEY_SIZE] {
        self.identity.public_key()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contacts(&self) -> &ContactBook {
        &self.contacts
    }

    pub fn add_contact(&mut self, record: ContactRecord) -> Result<(), NodeError> {
        Ok(self.contacts.upsert(record)?)
    }

    pub fn messenger(&self) -> &ReliableMessenger {
        &self.messenger
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<T> {
        &mut self.dispatcher
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn current_time(&self) -> u32 {
        self.clock.current_time()
    }

    pub fn set_clock(&mut self, timestamp: u32) -> Result<(), ClockError> {
        set_clock_manually(&mut self.clock, timestamp)
    }

    pub fn ack_deadline_ms(&self) -> Option<u64> {
        self.ack_deadline_ms
    }

    /// Reliable direct message. Returns the ack token being waited for.
    pub fn send_text(
        &mut self,
        recipient: &[u8; PUB_KEY_SIZE],
        text: &str,
    ) -> Result<u32, NodeError> {
        let contact = self
            .contacts
            .by_key(recipient)
            .ok_or(NodeError::UnknownContact)?;
        let out = self
            .messenger
            .send(contact, text, self.clock.current_time())?;
        let token = out.ack_token;
        self.queue_text(out)?;
        Ok(token)
    }

    /// Broadcast on the public channel as `"name: text"`.
    pub fn send_channel_text(&mut self, text: &str) -> Result<(), NodeError> {
        if text.is_empty() {
            return Err(SendError::EmptyText.into());
        }
        // The sender prefix counts against the text limit.
        let text = format!("{}: {}", self.name, text);
        if text.len() > MAX_TEXT_LEN {
            return Err(SendError::TextTooLong(text.len()).into());
        }
        let msg = GroupText {
            channel_hash: self.channel,
            timestamp: self.clock.current_time(),
            flags: 0,
            text,
        };
        let hash = channel_message_hash(msg.timestamp, msg.channel_hash, &msg.text);
        self.messenger.mark_seen(hash, msg.timestamp);
        self.flood(PayloadType::GroupText, msg.encode())
    }

    /// Announce our key and name.
    pub fn send_advert(&mut self) -> Result<(), NodeError> {
        let public_key = self.identity.public_key();
        let timestamp = self.clock.current_time();
        let signature = self
            .identity
            .sign(&Advert::signed_bytes(&public_key, timestamp, &self.name));
        let advert = Advert {
            public_key,
            timestamp,
            signature,
            name: self.name.clone(),
        };
        self.flood(PayloadType::Advert, advert.encode())
    }

    /// One control-loop step.
    pub fn poll(&mut self, now_ms: u64) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        let received = self.dispatcher.poll(now_ms);
        self.arm_ack_deadline(now_ms);
        if let Some(frame) = received {
            self.handle_frame(&frame, &mut events);
        }

        if self.ack_deadline_ms.is_some_and(|d| now_ms >= d) {
            self.ack_deadline_ms = None;
            self.on_ack_timeout(now_ms, &mut events);
        }
        events
    }

    fn arm_ack_deadline(&mut self, now_ms: u64) {
        let Some(queued) = self.awaiting_tx else {
            return;
        };
        if self.dispatcher.has_started(queued.ticket) {
            self.awaiting_tx = None;
            self.ack_deadline_ms = Some(now_ms + u64::from(queued.timeout_ms));
        }
    }

    fn on_ack_timeout(&mut self, now_ms: u64, events: &mut Vec<NodeEvent>) {
        let recipient = self.messenger.pending().map(|p| p.recipient);
        let contact = recipient.and_then(|key| self.contacts.by_key_mut(&key));
        match self.messenger.on_send_timeout(contact) {
            TimeoutOutcome::Retry(out) => {
                let attempt = out.message.attempt;
                tracing::debug!(attempt, "ack timeout, retrying");
                if let Err(e) = self.queue_text(out) {
                    tracing::warn!(error = %e, attempt, "retry not queued");
                    // Count the attempt anyway so the send still ends.
                    self.ack_deadline_ms = Some(now_ms + u64::from(flood_timeout_ms(0)));
                }
            }
            TimeoutOutcome::GaveUp { recipient, text } => {
                events.push(NodeEvent::SendFailed { recipient, text });
            }
            TimeoutOutcome::NoPending => {}
        }
    }

    fn queue_text(&mut self, out: OutboundText) -> Result<(), NodeError> {
        let (route, path) = match &out.delivery {
            Delivery::Direct(path) => (RouteType::Direct, path.clone()),
            Delivery::Flood => (RouteType::Flood, Vec::new()),
        };
        let bytes = Packet::new(route, PayloadType::TextMessage, path, out.message.encode()).to_bytes()?;
        let airtime = self.dispatcher.radio().estimated_airtime_ms(bytes.len());
        let ticket = self.dispatcher.enqueue(bytes)?;
        self.ack_deadline_ms = None;
        self.awaiting_tx = Some(QueuedText {
            ticket,
            timeout_ms: out.delivery.timeout_ms(airtime),
        });
        Ok(())
    }

    fn flood(&mut self, payload_type: PayloadType, payload: Vec<u8>) -> Result<(), NodeError> {
        let bytes = Packet::new(RouteType::Flood, payload_type, Vec::new(), payload).to_bytes()?;
        self.dispatcher.enqueue(bytes)?;
        Ok(())
    }

    fn handle_frame(&mut self, frame: &ReceivedFrame, events: &mut Vec<NodeEvent>) {
        let packet = match Packet::from_bytes(&frame.bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable packet dropped");
                return;
            }
        };
        let result = match packet.payload_type() {
            Ok(PayloadType::TextMessage) => self.on_text(&packet.payload, events),
            Ok(PayloadType::Ack) => self.on_ack(&packet.payload, events),
            Ok(PayloadType::GroupText) => self.on_group_text(&packet.payload, events),
            Ok(PayloadType::Advert) => self.on_advert(&packet.payload, events),
            Ok(other) => {
                tracing::debug!(payload_type = ?other, "payload type not handled");
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, rssi = frame.rssi, "inbound packet rejected");
        }
    }

    fn on_text(&mut self, payload: &[u8], events: &mut Vec<NodeEvent>) -> Result<(), NodeError> {
        let msg = TextMessage::decode(payload)?;
        if msg.dest_hash != self.identity.public_key()[0] {
            return Ok(());
        }
        let Some(sender) = self.contacts.by_hash(msg.src_hash) else {
            tracing::debug!(src = msg.src_hash, "text from unknown sender");
            return Ok(());
        };
        let (from, name) = (sender.public_key, sender.name.clone());

        let verdict = self
            .messenger
            .on_direct_message(&from, &msg, &mut self.clock);
        if let Some(token) = verdict.ack_token {
            // The message is already in the dedup ring; deliver it even if the ack can't go out.
            if let Err(e) = self.flood(PayloadType::Ack, encode_ack(token)) {
                tracing::warn!(error = %e, "ack not queued");
            }
        }
        push_clock_event(verdict.clock, events);
        if verdict.deliver {
            events.push(NodeEvent::MessageReceived {
                from,
                name,
                text: msg.text,
                timestamp: msg.timestamp,
            });
        }
        Ok(())
    }

    fn on_ack(&mut self, payload: &[u8], events: &mut Vec<NodeEvent>) -> Result<(), NodeError> {
        match self.messenger.on_ack(decode_ack(payload)?) {
            AckOutcome::Matched { recipient, attempt } => {
                self.ack_deadline_ms = None;
                self.awaiting_tx = None;
                events.push(NodeEvent::Delivered { recipient, attempt });
            }
            AckOutcome::AlreadyAcked => tracing::debug!("repeated ack ignored"),
            AckOutcome::Unknown => {}
        }
        Ok(())
    }

    fn on_group_text(&mut self, payload: &[u8], events: &mut Vec<NodeEvent>) -> Result<(), NodeError> {
        let msg = GroupText::decode(payload)?;
        if msg.channel_hash != self.channel {
            return Ok(());
        }
        let verdict = self.messenger.on_channel_message(&msg, &mut self.clock);
        push_clock_event(verdict.clock, events);
        if verdict.deliver {
            events.push(NodeEvent::ChannelMessage {
                text: msg.text,
                timestamp: msg.timestamp,
            });
        }
        Ok(())
    }

    fn on_advert(&mut self, payload: &[u8], events: &mut Vec<NodeEvent>) -> Result<(), NodeError> {
        let advert = Advert::decode(payload)?;
        if advert.public_key == self.identity.public_key() {
            return Ok(());
        }
        let signed = Advert::signed_bytes(&advert.public_key, advert.timestamp, &advert.name);
        if !identity::verify(&advert.public_key, &signed, &advert.signature) {
            tracing::debug!("advert with bad signature dropped");
            return Ok(());
        }

        let mut record = self
            .contacts
            .by_key(&advert.public_key)
            .cloned()
            .unwrap_or_else(|| ContactRecord::new(advert.public_key, advert.name.clone()));
        if advert.timestamp <= record.last_advert {
            tracing::debug!("replayed advert ignored");
            return Ok(());
        }
        record.name = advert.name.clone();
        record.last_advert = advert.timestamp;
        self.contacts.upsert(record)?;

        let outcome = self
            .messenger
            .observe_timestamp(advert.timestamp, &mut self.clock);
        push_clock_event(outcome, events);
        events.push(NodeEvent::ContactHeard {
            public_key: advert.public_key,
            name: advert.name,
        });
        Ok(())
    }
}

fn push_clock_event(outcome: ClockSyncOutcome, events: &mut Vec<NodeEvent>) {
    if let ClockSyncOutcome::Adjusted { from, to } = outcome {
        events.push(NodeEvent::ClockAdjusted { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::radio::RadioParams;
    use crate::reliability::SendState;
    use crate::test_support::{ManualClock, MockTransceiver};

    const T: u32 = 1_700_000_000;

    type TestNode = Node<MockTransceiver, ManualClock>;

    fn node(seed: u8, name: &str) -> TestNode {
        let mut driver = MockTransceiver::new(-110);
        driver.auto_complete = true;
        let dispatcher =
            Dispatcher::new(driver, RadioParams::default(), DispatcherConfig::default()).unwrap();
        Node::new(
            dispatcher,
            LocalIdentity::from_seed([seed; 32]),
            ManualClock::at(T),
            ContactBook::new(),
            name,
        )
    }

    fn pair() -> (TestNode, TestNode) {
        let mut a = node(1, "alice");
        let mut b = node(2, "bob");
        a.add_contact(ContactRecord::new(b.public_key(), "bob")).unwrap();
        b.add_contact(ContactRecord::new(a.public_key(), "alice")).unwrap();
        (a, b)
    }

    fn take_sent(n: &mut TestNode) -> Vec<Vec<u8>> {
        std::mem::take(&mut n.dispatcher_mut().radio_mut().driver_mut().sent)
    }

    fn deliver(frames: Vec<Vec<u8>>, to: &mut TestNode) {
        for f in frames {
            to.dispatcher_mut().radio_mut().driver_mut().inject_frame(f);
        }
    }

    /// Poll both nodes over `range`, relaying every transmission to the other side.
    fn run(
        a: &mut TestNode,
        b: &mut TestNode,
        range: std::ops::Range<u64>,
    ) -> (Vec<NodeEvent>, Vec<NodeEvent>) {
        let (mut ea, mut eb) = (Vec::new(), Vec::new());
        for t in range {
            ea.extend(a.poll(t));
            let sent = take_sent(a);
            deliver(sent, b);
            eb.extend(b.poll(t));
            let sent = take_sent(b);
            deliver(sent, a);
        }
        (ea, eb)
    }

    #[test]
    fn text_delivered_and_acked() {
        let (mut a, mut b) = pair();
        let bob = b.public_key();
        a.send_text(&bob, "hello bob").unwrap();
        let (ea, eb) = run(&mut a, &mut b, 0..20);

        assert_eq!(
            eb,
            vec![NodeEvent::MessageReceived {
                from: a.public_key(),
                name: "alice".into(),
                text: "hello bob".into(),
                timestamp: T,
            }]
        );
        assert_eq!(ea, vec![NodeEvent::Delivered { recipient: bob, attempt: 0 }]);
        assert_eq!(a.ack_deadline_ms(), None);
    }

    #[test]
    fn replayed_text_acked_not_redelivered() {
        let (mut a, mut b) = pair();
        let bob = b.public_key();
        a.send_text(&bob, "once").unwrap();
        a.poll(0);
        let frames = take_sent(&mut a);
        assert_eq!(frames.len(), 1);

        deliver(frames.clone(), &mut b);
        let first: Vec<_> = (0..5).flat_map(|t| b.poll(t)).collect();
        assert_eq!(first.len(), 1);
        assert_eq!(take_sent(&mut b).len(), 1);

        deliver(frames, &mut b);
        let second: Vec<_> = (1000..1005).flat_map(|t| b.poll(t)).collect();
        assert!(second.is_empty());
        // Acked again so the sender stops retrying.
        assert_eq!(take_sent(&mut b).len(), 1);
    }

    #[test]
    fn unanswered_send_retries_then_fails() {
        let (mut a, b) = pair();
        let bob = b.public_key();
        a.send_text(&bob, "anyone?").unwrap();

        let mut events = Vec::new();
        let mut transmissions = 0;
        for t in (0..40_000).step_by(10) {
            events.extend(a.poll(t));
            transmissions += take_sent(&mut a).len();
        }
        assert_eq!(transmissions, 4);
        assert_eq!(
            events,
            vec![NodeEvent::SendFailed {
                recipient: bob,
                text: "anyone?".into()
            }]
        );
        assert_eq!(a.ack_deadline_ms(), None);
    }

    #[test]
    fn retry_drops_learned_path() {
        let (mut a, b) = pair();
        let bob = b.public_key();
        let mut with_path = ContactRecord::new(bob, "bob");
        with_path.set_path(vec![9, 8]).unwrap();
        a.add_contact(with_path).unwrap();
        a.send_text(&bob, "hi").unwrap();

        let mut routes = Vec::new();
        for t in (0..20_000).step_by(10) {
            a.poll(t);
            for f in take_sent(&mut a) {
                routes.push(Packet::from_bytes(&f).unwrap().route_type());
            }
        }
        assert_eq!(
            routes,
            vec![RouteType::Direct, RouteType::Direct, RouteType::Flood, RouteType::Flood]
        );
        assert!(a.contacts().by_key(&bob).unwrap().out_path.is_none());
    }

    /// Hand `frames` to `peer` and return what it transmits in reply.
    fn reply_from(frames: Vec<Vec<u8>>, peer: &mut TestNode, start: u64) -> Vec<Vec<u8>> {
        deliver(frames, peer);
        for t in start..start + 5 {
            peer.poll(t);
        }
        take_sent(peer)
    }

    #[test]
    fn repeated_ack_delivers_once() {
        let (mut a, mut b) = pair();
        let bob = b.public_key();
        a.send_text(&bob, "ack me").unwrap();
        a.poll(0);
        let text = take_sent(&mut a);
        a.poll(1);
        let ack = reply_from(text, &mut b, 0);
        assert_eq!(ack.len(), 1);

        deliver(ack.clone(), &mut a);
        let first: Vec<_> = (2..4).flat_map(|t| a.poll(t)).collect();
        assert_eq!(first, vec![NodeEvent::Delivered { recipient: bob, attempt: 0 }]);

        deliver(ack, &mut a);
        let second: Vec<_> = (4..6).flat_map(|t| a.poll(t)).collect();
        assert!(second.is_empty());
        assert_eq!(a.dispatcher().radio().stats().packets_recv, 2);
        assert_eq!(a.ack_deadline_ms(), None);
    }

    #[test]
    fn ack_after_give_up_ignored() {
        let (mut a, mut b) = pair();
        let bob = b.public_key();
        a.send_text(&bob, "too late").unwrap();
        a.poll(0);
        let ack = reply_from(take_sent(&mut a), &mut b, 0);
        assert_eq!(ack.len(), 1);

        let mut events = Vec::new();
        let mut t = 1;
        while t < 40_000 && events.is_empty() {
            events.extend(a.poll(t));
            take_sent(&mut a);
            t += 10;
        }
        assert!(matches!(events.as_slice(), [NodeEvent::SendFailed { .. }]));

        deliver(ack, &mut a);
        let late: Vec<_> = (t..t + 5).flat_map(|t| a.poll(t)).collect();
        assert!(late.is_empty());
        assert_eq!(a.messenger().state(), SendState::GaveUp);
    }

    #[test]
    fn text_delivered_when_ack_queue_full() {
        let (mut a, mut b) = pair();
        let bob = b.public_key();
        a.send_text(&bob, "urgent").unwrap();
        a.poll(0);
        let text = take_sent(&mut a);

        // One transmission puts b in its duty-cycle silence, then the queue fills up.
        b.dispatcher_mut().enqueue(vec![1; 10]).unwrap();
        b.poll(0);
        b.poll(1);
        for _ in 0..b.dispatcher().config().queue_depth {
            b.dispatcher_mut().enqueue(vec![2; 10]).unwrap();
        }

        deliver(text, &mut b);
        let events = b.poll(2);
        assert_eq!(
            events,
            vec![NodeEvent::MessageReceived {
                from: a.public_key(),
                name: "alice".into(),
                text: "urgent".into(),
                timestamp: T,
            }]
        );
        assert_eq!(b.dispatcher().queue_len(), b.dispatcher().config().queue_depth);
    }

    #[test]
    fn ack_timer_starts_when_text_goes_on_air() {
        let (mut a, b) = pair();
        let bob = b.public_key();
        a.send_advert().unwrap();
        a.poll(0);
        let advert = take_sent(&mut a);
        assert_eq!(advert.len(), 1);
        a.poll(1);

        a.send_text(&bob, "queued").unwrap();
        let mut t = 2;
        let text = loop {
            a.poll(t);
            let sent = take_sent(&mut a);
            if let Some(frame) = sent.into_iter().next() {
                break frame;
            }
            // Still waiting out the advert's airtime.
            assert_eq!(a.ack_deadline_ms(), None);
            t += 1;
            assert!(t < 10_000);
        };
        let silence = u64::from(a.dispatcher().radio().estimated_airtime_ms(advert[0].len()));
        assert!(t > silence);
        let airtime = a.dispatcher().radio().estimated_airtime_ms(text.len());
        assert_eq!(a.ack_deadline_ms(), Some(t + u64::from(flood_timeout_ms(airtime))));

        // No second copy before the deadline.
        let deadline = t + u64::from(flood_timeout_ms(airtime));
        for now in t + 1..deadline {
            a.poll(now);
        }
        assert!(take_sent(&mut a).is_empty());
    }

    #[test]
    fn channel_text_limit_includes_name() {
        let (mut a, _) = pair();
        let prefix = "alice: ".len();
        let fits = "x".repeat(MAX_TEXT_LEN - prefix);
        a.send_channel_text(&fits).unwrap();
        let over = "x".repeat(MAX_TEXT_LEN - prefix + 1);
        assert!(matches!(
            a.send_channel_text(&over),
            Err(NodeError::Send(SendError::TextTooLong(n))) if n == MAX_TEXT_LEN + 1
        ));
    }

    #[test]
    fn unknown_recipient_rejected() {
        let (mut a, _) = pair();
        assert!(matches!(
            a.send_text(&[0x77; 32], "x"),
            Err(NodeError::UnknownContact)
        ));
        assert!(matches!(
            a.send_channel_text(""),
            Err(NodeError::Send(SendError::EmptyText))
        ));
    }

    #[test]
    fn channel_broadcast_reaches_peer() {
        let (mut a, mut b) = pair();
        a.send_channel_text("hi all").unwrap();
        let (ea, eb) = run(&mut a, &mut b, 0..10);
        assert!(ea.is_empty());
        assert_eq!(
            eb,
            vec![NodeEvent::ChannelMessage {
                text: "alice: hi all".into(),
                timestamp: T
            }]
        );
    }

    #[test]
    fn advert_adds_contact() {
        let mut a = node(1, "alice");
        let mut b = node(2, "bob");
        a.send_advert().unwrap();
        let (_, eb) = run(&mut a, &mut b, 0..10);
        assert_eq!(
            eb,
            vec![NodeEvent::ContactHeard {
                public_key: a.public_key(),
                name: "alice".into()
            }]
        );
        let c = b.contacts().by_key(&a.public_key()).unwrap();
        assert_eq!(c.last_advert, T);

        // Same advert again is a replay.
        a.send_advert().unwrap();
        let (_, eb) = run(&mut a, &mut b, 1000..1010);
        assert!(eb.is_empty());
        assert!(b.dispatcher().radio().stats().packets_recv >= 2);
    }

    #[test]
    fn manual_clock_only_moves_forward() {
        let (mut a, _) = pair();
        assert!(a.set_clock(T - 1).is_err());
        a.set_clock(T + 100).unwrap();
        assert_eq!(a.current_time(), T + 100);
    }
}
