use std::sync::Arc;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    completion::CompletionClient,
    config::Config,
    envelope::{Envelope, EventKind, SignalMessage},
    pending::PendingTable,
    transport::{Quote, Recipient, SignalTransport},
    trigger::TriggerSet,
};

/// Sent in place of a completion when the agent call fails. Delivery and
/// quoting behave exactly as they would for a successful completion.
const COMPLETION_APOLOGY: &str = "Sorry, I encountered an error processing your request.";

/// The dispatch loop: polls the transport, routes each envelope, and sweeps
/// expired pending prompts on an independent cadence.
///
/// Routing order per envelope: delivery receipts first (they may resolve a
/// deferred prompt), then linked-device echoes, then received messages.
/// Failures never escape an envelope; a bad completion becomes an apology
/// reply and a failed send is logged and dropped.
pub struct Bridge {
    config: Arc<Config>,
    transport: Arc<dyn SignalTransport>,
    completion: Arc<dyn CompletionClient>,
    triggers: TriggerSet,
    pending: PendingTable,
}

impl Bridge {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn SignalTransport>,
        completion: Arc<dyn CompletionClient>,
    ) -> Self {
        let triggers = TriggerSet::with_ai_prefix(&config.ai_prefix);
        let pending = PendingTable::new(config.pending_ttl);
        Self {
            config,
            transport,
            completion,
            triggers,
            pending,
        }
    }

    /// Runs until `shutdown` fires. An envelope being dispatched is always
    /// finished; cancellation is only observed between envelopes, and no new
    /// poll or sweep cycle starts afterwards.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let prefixes: Vec<&str> = self.triggers.prefixes().collect();
        info!(
            "bridge started; polling every {:?}, triggers {:?}",
            self.config.poll_interval, prefixes
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    let removed = self.pending.sweep_expired(Instant::now()).await;
                    if removed > 0 {
                        debug!("swept {removed} expired pending prompts");
                    }
                }
                _ = poll.tick() => self.poll_once(&shutdown).await,
            }
        }

        info!("bridge stopped");
    }

    async fn poll_once(&self, shutdown: &CancellationToken) {
        let batch = match self.transport.receive().await {
            Ok(batch) => batch,
            Err(err) => {
                warn!("receive failed: {err}");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        info!("received {} envelopes", batch.len());
        for message in &batch {
            if shutdown.is_cancelled() {
                debug!("shutdown requested mid-batch, stopping early");
                break;
            }
            self.process_message(message).await;
        }
    }

    async fn process_message(&self, message: &SignalMessage) {
        let envelope = &message.envelope;
        match envelope.classify() {
            EventKind::Receipt => self.handle_receipt(envelope).await,
            EventKind::Reflected => self.handle_reflected(envelope).await,
            EventKind::Received => self.handle_received(envelope).await,
            EventKind::Ignorable => {
                debug!("ignoring envelope from {:?}", envelope.source);
            }
        }
    }

    /// A delivery receipt can resolve at most one deferred prompt: the first
    /// acknowledged timestamp with a live pending entry.
    async fn handle_receipt(&self, envelope: &Envelope) {
        let Some(receipt) = &envelope.receipt_message else {
            return;
        };
        debug!(
            "delivery receipt from {} acking {} timestamps (at {})",
            envelope.source,
            receipt.timestamps.len(),
            receipt.when
        );

        let Some((timestamp, prompt)) = self.pending.take_if_present(&receipt.timestamps).await
        else {
            return;
        };
        info!(
            "receipt from {} resolved pending prompt at {timestamp}",
            envelope.source
        );

        let reply = self.complete_or_apologize(&prompt).await;
        let recipient = Recipient::Direct(envelope.source.clone());
        let quote = Quote {
            timestamp,
            author: envelope.source.clone(),
        };
        self.deliver(&recipient, &reply, Some(&quote)).await;
    }

    /// A triggered message the operator sent from a linked device. Group
    /// echoes carry their reply address and resolve immediately; direct ones
    /// are deferred until a delivery receipt reveals the recipient.
    async fn handle_reflected(&self, envelope: &Envelope) {
        let Some(text) = envelope.sent_text() else {
            return;
        };
        let Some(prompt) = self.triggered_prompt(text) else {
            return;
        };
        let timestamp = envelope.message_timestamp();

        if let Some(group) = envelope.group_id() {
            info!("triggered from linked device in group {group}");
            let reply = self.complete_or_apologize(prompt).await;
            let recipient = Recipient::Group(group.to_string());
            let quote = Quote {
                timestamp,
                author: envelope.source.clone(),
            };
            self.deliver(&recipient, &reply, Some(&quote)).await;
            return;
        }

        debug!(
            "deferring prompt at {timestamp} until a delivery receipt names the recipient (device claims {:?})",
            envelope.sent_destination()
        );
        self.pending.put(timestamp, prompt.to_string()).await;
    }

    /// A triggered message from a third party; reply straight back to the
    /// sender or their group.
    async fn handle_received(&self, envelope: &Envelope) {
        let Some(text) = envelope.received_text() else {
            return;
        };
        let Some(prompt) = self.triggered_prompt(text) else {
            return;
        };
        let Some(recipient) = self.reply_address(envelope) else {
            warn!("triggered message with no usable reply address, skipping");
            return;
        };
        let timestamp = envelope.message_timestamp();
        info!("triggered by message from {}", envelope.source);

        let reply = self.complete_or_apologize(prompt).await;
        let quote = Quote {
            timestamp,
            author: envelope.source.clone(),
        };
        self.deliver(&recipient, &reply, Some(&quote)).await;
    }

    fn triggered_prompt<'a>(&self, text: &'a str) -> Option<&'a str> {
        if !self.triggers.is_triggered(text) {
            return None;
        }
        let prompt = self.triggers.extract_prompt(text);
        if prompt.is_empty() {
            debug!("trigger with empty prompt, nothing to do");
            return None;
        }
        Some(prompt)
    }

    fn reply_address(&self, envelope: &Envelope) -> Option<Recipient> {
        if let Some(group) = envelope.group_id() {
            return Some(Recipient::Group(group.to_string()));
        }
        if envelope.source.is_empty() {
            return None;
        }
        Some(Recipient::Direct(envelope.source.clone()))
    }

    async fn complete_or_apologize(&self, prompt: &str) -> String {
        match self.completion.complete(prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("completion failed: {err}");
                COMPLETION_APOLOGY.to_string()
            }
        }
    }

    async fn deliver(&self, recipient: &Recipient, text: &str, quote: Option<&Quote>) {
        if let Err(err) = self.transport.send(recipient, text, quote).await {
            warn!("send failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DataMessage, GroupInfo, ReceiptMessage, SentMessage, SyncMessage};
    use crate::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        inbox: Mutex<Vec<SignalMessage>>,
        outbox: Mutex<Vec<(Recipient, String, Option<Quote>)>>,
        fail_sends: AtomicBool,
        fail_receives: AtomicBool,
    }

    impl FakeTransport {
        fn queue(&self, batch: Vec<SignalMessage>) {
            self.inbox.lock().unwrap().extend(batch);
        }

        fn sent(&self) -> Vec<(Recipient, String, Option<Quote>)> {
            self.outbox.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalTransport for FakeTransport {
        async fn receive(&self) -> crate::Result<Vec<SignalMessage>> {
            if self.fail_receives.load(Ordering::SeqCst) {
                return Err(Error::TransportPull("receive unavailable".to_string()));
            }
            Ok(std::mem::take(&mut *self.inbox.lock().unwrap()))
        }

        async fn send(
            &self,
            recipient: &Recipient,
            text: &str,
            quote: Option<&Quote>,
        ) -> crate::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::TransportPush("send exploded".to_string()));
            }
            self.outbox
                .lock()
                .unwrap()
                .push((recipient.clone(), text.to_string(), quote.cloned()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCompletion {
        calls: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl FakeCompletion {
        fn prompts(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionClient for FakeCompletion {
        async fn complete(&self, prompt: &str) -> crate::Result<String> {
            self.calls.lock().unwrap().push(prompt.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::CompletionTimeout);
            }
            Ok(format!("reply to: {prompt}"))
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            agent_url: "http://localhost:3000".to_string(),
            completion_timeout: Duration::from_secs(30),
            ai_prefix: "!ai".to_string(),
            signal_cli_path: "/usr/local/bin/signal-cli".into(),
            signal_account: None,
            signal_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            pending_ttl: Duration::from_secs(300),
        })
    }

    fn test_bridge() -> (Bridge, Arc<FakeTransport>, Arc<FakeCompletion>) {
        let transport = Arc::new(FakeTransport::default());
        let completion = Arc::new(FakeCompletion::default());
        let bridge = Bridge::new(test_config(), transport.clone(), completion.clone());
        (bridge, transport, completion)
    }

    fn reflected(source: &str, ts: i64, text: &str) -> SignalMessage {
        SignalMessage {
            envelope: Envelope {
                source: source.to_string(),
                timestamp: ts,
                sync_message: Some(SyncMessage {
                    sent_message: Some(SentMessage {
                        destination: Some("+15550002222".to_string()),
                        message: Some(text.to_string()),
                        timestamp: ts,
                        group_info: None,
                    }),
                }),
                ..Default::default()
            },
        }
    }

    fn reflected_group(source: &str, ts: i64, text: &str, group: &str) -> SignalMessage {
        let mut msg = reflected(source, ts, text);
        if let Some(sync) = &mut msg.envelope.sync_message {
            if let Some(sent) = &mut sync.sent_message {
                sent.destination = None;
                sent.group_info = Some(GroupInfo {
                    group_id: Some(group.to_string()),
                });
            }
        }
        msg
    }

    fn received(source: &str, ts: i64, text: &str) -> SignalMessage {
        SignalMessage {
            envelope: Envelope {
                source: source.to_string(),
                timestamp: ts,
                data_message: Some(DataMessage {
                    message: Some(text.to_string()),
                    timestamp: ts,
                    group_info: None,
                }),
                ..Default::default()
            },
        }
    }

    fn received_group(source: &str, ts: i64, text: &str, group: &str) -> SignalMessage {
        let mut msg = received(source, ts, text);
        if let Some(data) = &mut msg.envelope.data_message {
            data.group_info = Some(GroupInfo {
                group_id: Some(group.to_string()),
            });
        }
        msg
    }

    fn receipt(source: &str, acked: &[i64]) -> SignalMessage {
        SignalMessage {
            envelope: Envelope {
                source: source.to_string(),
                timestamp: acked.last().copied().unwrap_or_default() + 500,
                receipt_message: Some(ReceiptMessage {
                    when: acked.last().copied().unwrap_or_default() + 500,
                    is_delivery: true,
                    is_read: false,
                    timestamps: acked.to_vec(),
                }),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn reflected_direct_message_defers_until_receipt() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&reflected("+15550001111", 1000, "!ai what is 2+2"))
            .await;
        assert!(transport.sent().is_empty());
        assert!(completion.prompts().is_empty());

        bridge
            .process_message(&receipt("+15550002222", &[999, 1000]))
            .await;
        assert_eq!(completion.prompts(), vec!["what is 2+2"]);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (recipient, text, quote) = &sent[0];
        assert_eq!(*recipient, Recipient::Direct("+15550002222".to_string()));
        assert_eq!(text, "reply to: what is 2+2");
        assert_eq!(
            *quote,
            Some(Quote {
                timestamp: 1000,
                author: "+15550002222".to_string()
            })
        );
    }

    #[tokio::test]
    async fn duplicate_receipt_resolves_only_once() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&reflected("+15550001111", 1000, "!ai ping"))
            .await;
        bridge
            .process_message(&receipt("+15550002222", &[1000]))
            .await;
        bridge
            .process_message(&receipt("+15550002222", &[1000]))
            .await;

        assert_eq!(completion.prompts().len(), 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn receipt_resolves_at_most_one_pending_prompt() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&reflected("+15550001111", 1000, "!ai first"))
            .await;
        bridge
            .process_message(&reflected("+15550001111", 1001, "!ai second"))
            .await;
        bridge
            .process_message(&receipt("+15550002222", &[1000, 1001]))
            .await;

        assert_eq!(completion.prompts(), vec!["first"]);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn reflected_group_message_resolves_synchronously() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&reflected_group(
                "+15550001111",
                1000,
                "!ai plan dinner",
                "grp-1",
            ))
            .await;

        assert_eq!(completion.prompts(), vec!["plan dinner"]);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Recipient::Group("grp-1".to_string()));
        assert_eq!(
            sent[0].2,
            Some(Quote {
                timestamp: 1000,
                author: "+15550001111".to_string()
            })
        );

        // Nothing was deferred, so a later receipt is a no-op.
        bridge
            .process_message(&receipt("+15550002222", &[1000]))
            .await;
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn received_group_message_replies_in_place() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&received_group(
                "+15553334444",
                2000,
                "🤖 summarize this",
                "grp-2",
            ))
            .await;

        assert_eq!(completion.prompts(), vec!["summarize this"]);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Recipient::Group("grp-2".to_string()));
        assert_eq!(
            sent[0].2,
            Some(Quote {
                timestamp: 2000,
                author: "+15553334444".to_string()
            })
        );
    }

    #[tokio::test]
    async fn received_direct_message_replies_to_sender() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&received("+15553334444", 2000, "qq how are you"))
            .await;

        assert_eq!(completion.prompts(), vec!["how are you"]);
        let sent = transport.sent();
        assert_eq!(sent[0].0, Recipient::Direct("+15553334444".to_string()));
    }

    #[tokio::test]
    async fn untriggered_text_is_ignored() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&received("+15553334444", 2000, "hello there"))
            .await;
        bridge
            .process_message(&reflected("+15550001111", 2001, "see you at 6"))
            .await;

        assert!(completion.prompts().is_empty());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn empty_prompt_does_nothing() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&reflected("+15550001111", 1000, "!ai "))
            .await;
        assert!(completion.prompts().is_empty());

        // No entry was stored either.
        bridge
            .process_message(&receipt("+15550002222", &[1000]))
            .await;
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn receipt_without_pending_entry_is_a_noop() {
        let (bridge, transport, completion) = test_bridge();

        bridge
            .process_message(&receipt("+15550002222", &[4242]))
            .await;

        assert!(completion.prompts().is_empty());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn completion_failure_sends_apology_with_quote() {
        let (bridge, transport, completion) = test_bridge();
        completion.fail.store(true, Ordering::SeqCst);

        bridge
            .process_message(&received("+15553334444", 2000, "!ai broken"))
            .await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, COMPLETION_APOLOGY);
        assert_eq!(
            sent[0].2,
            Some(Quote {
                timestamp: 2000,
                author: "+15553334444".to_string()
            })
        );
    }

    #[tokio::test]
    async fn send_failure_does_not_stop_the_batch() {
        let (bridge, transport, completion) = test_bridge();
        transport.fail_sends.store(true, Ordering::SeqCst);
        transport.queue(vec![
            received("+15553334444", 2000, "!ai one"),
            received("+15555556666", 2001, "!ai two"),
        ]);

        bridge.poll_once(&CancellationToken::new()).await;

        assert_eq!(completion.prompts(), vec!["one", "two"]);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn receive_failure_skips_the_cycle() {
        let (bridge, transport, completion) = test_bridge();
        transport.fail_receives.store(true, Ordering::SeqCst);

        bridge.poll_once(&CancellationToken::new()).await;
        assert!(completion.prompts().is_empty());

        transport.fail_receives.store(false, Ordering::SeqCst);
        transport.queue(vec![received("+15553334444", 2000, "qq still alive")]);
        bridge.poll_once(&CancellationToken::new()).await;
        assert_eq!(completion.prompts(), vec!["still alive"]);
    }

    #[tokio::test]
    async fn received_message_without_reply_address_is_skipped() {
        let (bridge, transport, completion) = test_bridge();

        bridge.process_message(&received("", 2000, "!ai lost")).await;

        assert!(completion.prompts().is_empty());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_and_stops_on_shutdown() {
        let (bridge, transport, completion) = test_bridge();
        transport.queue(vec![
            reflected("+15550001111", 1000, "!ai what is 2+2"),
            receipt("+15550002222", &[1000]),
        ]);

        let bridge = Arc::new(bridge);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn({
            let bridge = bridge.clone();
            let shutdown = shutdown.clone();
            async move { bridge.run(shutdown).await }
        });

        // The first poll tick fires straight away, but the freshly spawned
        // worker still needs scheduler turns before its outbox fills.
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..100 {
            if !transport.sent().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(completion.prompts(), vec!["what is 2+2"]);
        assert_eq!(transport.sent().len(), 1);

        // Later ticks poll an empty inbox and send nothing further.
        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.sent().len(), 1);

        shutdown.cancel();
        worker.await.unwrap();
        assert_eq!(transport.sent().len(), 1);
    }
}
