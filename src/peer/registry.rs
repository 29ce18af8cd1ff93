//! Registry of remote instances.
//!
//! Each instance sits behind its own mutex so updates for one peer never
//! wait on another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::consent::{
    Axis, ConsentAction, ConsentInput, ConsentMessage, Transition, TrustState,
};
use crate::error::{Error, Result};
use crate::peer::{
    InstanceHandshake, InstanceStore, PeerEvent, PeerMessage, PeerMessenger, RemoteInstance,
    SessionStatus,
};

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 128;

/// Owns one [`RemoteInstance`] (and so one consent state machine) per peer.
pub struct PeerRegistry {
    local: InstanceHandshake,
    instances: RwLock<HashMap<String, Arc<Mutex<RemoteInstance>>>>,
    messenger: Arc<dyn PeerMessenger>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new(local: InstanceHandshake, messenger: Arc<dyn PeerMessenger>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            instances: RwLock::new(HashMap::new()),
            messenger,
            events,
        }
    }

    pub fn local_instance_id(&self) -> &str {
        &self.local.instance_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    fn entry(&self, instance_id: &str) -> Result<Arc<Mutex<RemoteInstance>>> {
        self.instances
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::UnknownPeer(instance_id.to_string()))
    }

    fn publish(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_transition(&self, instance_id: &str, transition: &Transition) {
        if transition.is_noop() {
            return;
        }
        self.publish(PeerEvent::ConsentChanged {
            instance_id: instance_id.to_string(),
            trust: transition.after,
        });
        if let Some(granted) = transition.proxy_access_changed() {
            tracing::info!(
                "Proxy access {} for {}",
                if granted { "granted" } else { "revoked" },
                instance_id
            );
            self.publish(PeerEvent::ProxyAccessChanged {
                instance_id: instance_id.to_string(),
                granted,
            });
        }
        if let Some(granted) = transition.client_access_changed() {
            tracing::info!(
                "Client access {} for {}",
                if granted { "granted" } else { "revoked" },
                instance_id
            );
            self.publish(PeerEvent::ClientAccessChanged {
                instance_id: instance_id.to_string(),
                granted,
            });
        }
    }

    /// Record a handshake from a peer. Returns true if the peer was new.
    pub fn handle_handshake(&self, handshake: &InstanceHandshake) -> Result<bool> {
        if handshake.instance_id.is_empty() {
            return Err(Error::InvalidMessage("handshake without instance id".into()));
        }
        if handshake.instance_id == self.local.instance_id {
            return Err(Error::InvalidMessage("handshake from our own instance id".into()));
        }

        let existing = self.instances.read().get(&handshake.instance_id).cloned();
        let came_online = match existing {
            Some(entry) => {
                let mut instance = entry.lock();
                if instance.update(handshake) {
                    tracing::warn!("Key for {} changed", handshake.instance_id);
                }
                let was_online = instance.online;
                instance.online = true;
                if was_online {
                    None
                } else {
                    Some(false)
                }
            }
            None => {
                let mut instances = self.instances.write();
                let created = !instances.contains_key(&handshake.instance_id);
                instances
                    .entry(handshake.instance_id.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(RemoteInstance::from_handshake(handshake)))
                    })
                    .lock()
                    .online = true;
                Some(created)
            }
        };

        let Some(created) = came_online else {
            return Ok(false);
        };
        if created {
            tracing::info!("New peer {}", handshake.instance_id);
        }
        self.publish(PeerEvent::OnlineChanged {
            instance_id: handshake.instance_id.clone(),
            online: true,
        });
        Ok(created)
    }

    /// Send our identity and current consent signal to a peer.
    pub fn send_handshake(&self, instance_id: &str) -> Result<()> {
        self.messenger
            .send_to_peer(instance_id, PeerMessage::Handshake(self.local.clone()))?;
        if let Some(trust) = self.trust(instance_id) {
            self.messenger.send_to_peer(
                instance_id,
                PeerMessage::Consent(ConsentMessage::new(
                    self.local.instance_id.clone(),
                    trust.outbound_signal(),
                )),
            )?;
        }
        Ok(())
    }

    /// Apply a local user action and tell the peer.
    pub fn modify_consent(&self, instance_id: &str, action: ConsentAction) -> Result<Transition> {
        let entry = self.entry(instance_id)?;
        let transition = entry.lock().trust.apply(ConsentInput::Local(action))?;

        if let Some(signal) = transition.outbound {
            let msg = ConsentMessage::new(self.local.instance_id.clone(), signal);
            if let Err(e) = self
                .messenger
                .send_to_peer(instance_id, PeerMessage::Consent(msg))
            {
                tracing::warn!("Could not send consent to {}: {}", instance_id, e);
            }
        }

        self.publish_transition(instance_id, &transition);
        Ok(transition)
    }

    /// Apply a consent message received from a peer.
    pub fn handle_consent_message(&self, msg: &ConsentMessage) -> Result<Transition> {
        let entry = self.entry(&msg.instance_id)?;
        let transition = entry.lock().trust.apply(ConsentInput::Remote(msg.consent))?;
        self.publish_transition(&msg.instance_id, &transition);
        Ok(transition)
    }

    pub fn set_online(&self, instance_id: &str, online: bool) -> Result<()> {
        let entry = self.entry(instance_id)?;
        let changed = {
            let mut instance = entry.lock();
            let changed = instance.online != online;
            instance.online = online;
            changed
        };
        if changed {
            self.publish(PeerEvent::OnlineChanged {
                instance_id: instance_id.to_string(),
                online,
            });
        }
        Ok(())
    }

    /// Drop everything known about a peer.
    pub fn forget(&self, instance_id: &str) -> Result<RemoteInstance> {
        let entry = self
            .instances
            .write()
            .remove(instance_id)
            .ok_or_else(|| Error::UnknownPeer(instance_id.to_string()))?;
        tracing::info!("Forgot peer {}", instance_id);
        self.publish(PeerEvent::Forgotten {
            instance_id: instance_id.to_string(),
        });
        let instance = entry.lock().clone();
        Ok(instance)
    }

    /// Surface a session state change to the UI layer.
    pub fn report_session_status(&self, instance_id: &str, axis: Axis, status: SessionStatus) {
        self.publish(PeerEvent::SessionStatus {
            instance_id: instance_id.to_string(),
            axis,
            status,
        });
    }

    pub fn get(&self, instance_id: &str) -> Option<RemoteInstance> {
        self.instances
            .read()
            .get(instance_id)
            .map(|entry| entry.lock().clone())
    }

    pub fn trust(&self, instance_id: &str) -> Option<TrustState> {
        self.instances
            .read()
            .get(instance_id)
            .map(|entry| entry.lock().trust)
    }

    /// May this peer proxy for us?
    pub fn is_proxy_granted(&self, instance_id: &str) -> bool {
        self.trust(instance_id)
            .is_some_and(|t| t.proxy_consent.is_granted())
    }

    /// May this peer proxy through us?
    pub fn is_client_granted(&self, instance_id: &str) -> bool {
        self.trust(instance_id)
            .is_some_and(|t| t.client_consent.is_granted())
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.instances.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist every instance as one JSON blob.
    pub fn save(&self, store: &dyn InstanceStore) -> Result<()> {
        let snapshot: BTreeMap<String, RemoteInstance> = self
            .instances
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.lock().clone()))
            .collect();
        let blob = serde_json::to_vec(&snapshot)?;
        store.save(&blob)
    }

    /// Merge saved instances into the registry. Returns how many were loaded.
    ///
    /// Entries already present (e.g. from a handshake) win.
    pub fn load(&self, store: &dyn InstanceStore) -> Result<usize> {
        let Some(blob) = store.load()? else {
            return Ok(0);
        };
        let saved: BTreeMap<String, RemoteInstance> = serde_json::from_slice(&blob)?;

        let mut instances = self.instances.write();
        let mut loaded = 0;
        for (id, mut instance) in saved {
            if id != instance.instance_id {
                return Err(Error::Persistence(format!(
                    "record for {} is keyed as {}",
                    instance.instance_id, id
                )));
            }
            instance.online = false;
            if !instances.contains_key(&id) {
                instances.insert(id, Arc::new(Mutex::new(instance)));
                loaded += 1;
            }
        }
        tracing::debug!("Loaded {} peers", loaded);
        Ok(loaded)
    }
}
