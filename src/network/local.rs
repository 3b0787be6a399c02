use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::error::RelayError;
use crate::models::{ChannelKey, Identity, MemberProfile, Roster, RosterEntry, SignalingEnvelope, VoiceFlags};

use super::{PresenceChannel, SignalingBus};

struct ChannelState {
    roster: watch::Sender<Roster>,
    signals: Vec<mpsc::UnboundedSender<SignalingEnvelope>>,
}

impl ChannelState {
    fn new() -> Self {
        let (roster, _) = watch::channel(Roster::new());
        Self {
            roster,
            signals: Vec::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.roster.borrow().is_empty()
            && self.roster.receiver_count() == 0
            && self.signals.iter().all(|tx| tx.is_closed())
    }
}

fn prune(channels: &mut HashMap<ChannelKey, ChannelState>, channel: &ChannelKey) {
    if let Some(state) = channels.get_mut(channel) {
        state.signals.retain(|tx| !tx.is_closed());
        if state.is_idle() {
            channels.remove(channel);
            debug!("Dropped idle channel {}", channel);
        }
    }
}

/// In-process presence and signaling for any number of channels.
/// Cloning shares the same relay.
#[derive(Clone, Default)]
pub struct LocalRelay {
    channels: Arc<Mutex<HashMap<ChannelKey, ChannelState>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn roster(&self, channel: &ChannelKey) -> Roster {
        let channels = self.channels.lock().await;
        channels
            .get(channel)
            .map(|state| state.roster.borrow().clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Drop a member's entry the way a lost connection would, without the
    /// member retracting it.
    pub async fn disconnect(&self, channel: &ChannelKey, member: &Identity) {
        let channels = self.channels.lock().await;
        if let Some(state) = channels.get(channel) {
            state.roster.send_if_modified(|roster| roster.remove(member).is_some());
            debug!("Simulated disconnect of {} from {}", member, channel);
        }
    }
}

#[async_trait]
impl PresenceChannel for LocalRelay {
    async fn subscribe(&self, channel: &ChannelKey) -> Result<watch::Receiver<Roster>, RelayError> {
        let mut channels = self.channels.lock().await;
        let state = channels.entry(channel.clone()).or_insert_with(ChannelState::new);
        Ok(state.roster.subscribe())
    }

    async fn publish_self(
        &self,
        channel: &ChannelKey,
        member: &Identity,
        profile: &MemberProfile,
    ) -> Result<(), RelayError> {
        let mut channels = self.channels.lock().await;
        let state = channels.entry(channel.clone()).or_insert_with(ChannelState::new);
        state.roster.send_modify(|roster| {
            roster.insert(member.clone(), RosterEntry::new(profile.clone()));
        });
        Ok(())
    }

    async fn update_self(
        &self,
        channel: &ChannelKey,
        member: &Identity,
        flags: &VoiceFlags,
    ) -> Result<(), RelayError> {
        let channels = self.channels.lock().await;
        if let Some(state) = channels.get(channel) {
            state.roster.send_if_modified(|roster| match roster.get_mut(member) {
                Some(entry) => {
                    entry.apply(flags);
                    true
                }
                None => false,
            });
        }
        Ok(())
    }

    async fn retract_self(&self, channel: &ChannelKey, member: &Identity) -> Result<(), RelayError> {
        let mut channels = self.channels.lock().await;
        if let Some(state) = channels.get(channel) {
            state.roster.send_if_modified(|roster| roster.remove(member).is_some());
        }
        prune(&mut channels, channel);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), RelayError> {
        prune(&mut *self.channels.lock().await, channel);
        Ok(())
    }
}

#[async_trait]
impl SignalingBus for LocalRelay {
    async fn subscribe(
        &self,
        channel: &ChannelKey,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEnvelope>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.clone())
            .or_insert_with(ChannelState::new)
            .signals
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, channel: &ChannelKey, envelope: SignalingEnvelope) -> Result<(), RelayError> {
        let mut channels = self.channels.lock().await;
        if let Some(state) = channels.get_mut(channel) {
            state.signals.retain(|tx| tx.send(envelope.clone()).is_ok());
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), RelayError> {
        prune(&mut *self.channels.lock().await, channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NetworkCandidate;

    fn profile(name: &str) -> MemberProfile {
        MemberProfile {
            display_name: name.into(),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn roster_tracks_publish_update_and_retract() {
        let relay = LocalRelay::new();
        let channel = ChannelKey::new("r", "voice");
        let alice = Identity::from("alice");
        let mut rx = PresenceChannel::subscribe(&relay, &channel).await.unwrap();

        relay.publish_self(&channel, &alice, &profile("Alice")).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains_key(&alice));

        relay
            .update_self(
                &channel,
                &alice,
                &VoiceFlags {
                    streaming: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        rx.changed().await.unwrap();
        let entry = rx.borrow_and_update().get(&alice).cloned().unwrap();
        assert!(entry.streaming);
        assert!(!entry.muted);
        assert_eq!(entry.display_name, "Alice");

        relay.retract_self(&channel, &alice).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn disconnect_removes_entry_without_retract() {
        let relay = LocalRelay::new();
        let channel = ChannelKey::new("r", "voice");
        let (a, b) = (Identity::from("a"), Identity::from("b"));
        relay.publish_self(&channel, &a, &profile("A")).await.unwrap();
        relay.publish_self(&channel, &b, &profile("B")).await.unwrap();

        relay.disconnect(&channel, &a).await;

        let roster = relay.roster(&channel).await;
        assert_eq!(roster.keys().collect::<Vec<_>>(), vec![&b]);
    }

    #[tokio::test]
    async fn channel_is_dropped_once_nobody_uses_it() {
        let relay = LocalRelay::new();
        let channel = ChannelKey::new("r", "voice");
        let alice = Identity::from("alice");
        let roster_rx = PresenceChannel::subscribe(&relay, &channel).await.unwrap();
        let signal_rx = SignalingBus::subscribe(&relay, &channel).await.unwrap();
        relay.publish_self(&channel, &alice, &profile("Alice")).await.unwrap();

        // Still subscribed, so retracting keeps the channel.
        relay.retract_self(&channel, &alice).await.unwrap();
        assert_eq!(relay.channel_count().await, 1);

        drop(signal_rx);
        SignalingBus::unsubscribe(&relay, &channel).await.unwrap();
        assert_eq!(relay.channel_count().await, 1);

        drop(roster_rx);
        PresenceChannel::unsubscribe(&relay, &channel).await.unwrap();
        assert_eq!(relay.channel_count().await, 0);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let relay = LocalRelay::new();
        let one = ChannelKey::new("r", "one");
        let two = ChannelKey::new("r", "two");
        relay.publish_self(&one, &"a".into(), &profile("A")).await.unwrap();
        assert!(relay.roster(&two).await.is_empty());

        let mut rx_two = SignalingBus::subscribe(&relay, &two).await.unwrap();
        let env = SignalingEnvelope::candidate("a".into(), "b".into(), NetworkCandidate::new("c"));
        relay.publish(&one, env).await.unwrap();
        assert!(rx_two.try_recv().is_err());
    }

    #[tokio::test]
    async fn signals_fan_out_in_order() {
        let relay = LocalRelay::new();
        let channel = ChannelKey::new("r", "voice");
        let mut rx1 = SignalingBus::subscribe(&relay, &channel).await.unwrap();
        let mut rx2 = SignalingBus::subscribe(&relay, &channel).await.unwrap();

        for n in 0..3 {
            let env = SignalingEnvelope::candidate(
                "a".into(),
                "b".into(),
                NetworkCandidate::new(format!("c{n}")),
            );
            relay.publish(&channel, env).await.unwrap();
        }
        assert_eq!(rx2.recv().await.unwrap().kind, crate::models::SignalKind::Candidate);

        for n in 0..3 {
            let env = rx1.recv().await.unwrap();
            assert_eq!(
                env.payload,
                crate::models::SignalPayload::Candidate(NetworkCandidate::new(format!("c{n}")))
            );
        }
    }
}
