//! Channel registry
//!
//! Maps channel names to member sets and implements role-asymmetric fan-out:
//! a line is delivered to every member whose `connection_type` differs from
//! the sender's, so controllers only hear controlled peers and vice versa.
//! One read/write lock protects the map and the ID counter. Fan-out runs
//! under the read lock; mutations take the write lock and never enqueue to a
//! peer while holding it.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::client::Client;
use crate::message::{Msg, ServerMessage, DELIMITER, ROLE_CONTROLLER};
use crate::types::ClientId;

/// Members of one channel.
type Members = HashMap<ClientId, Arc<Client>>;

struct RegistryState {
    channels: HashMap<String, Members>,
    next_id: u64,
}

/// The channel registry. Holds non-owning references to clients and never
/// closes one; teardown always goes through the client itself.
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                channels: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a freshly joined client.
    ///
    /// Mints the next ID, announces `client_joined` to the channel while the
    /// client is not yet a member (so it never hears its own announcement),
    /// then inserts it and snapshots the role-differing peers for the
    /// `channel_joined` reply, which is sent outside the lock.
    pub async fn add_client(&self, client: Arc<Client>) {
        let Some(channel) = client.channel().map(str::to_owned) else {
            return;
        };

        let id = {
            let mut state = self.state.write().await;
            state.next_id += 1;
            ClientId(state.next_id)
        };
        client.assign_id(id);

        match (ServerMessage::ClientJoined {
            user_id: id,
            client: client.info(),
        })
        .to_line()
        {
            Ok(line) => self.send_line_to_channel(&client, &line, false).await,
            Err(err) => error!(client = %client.label(), %err, "failed to encode join notice"),
        }

        let (user_ids, clients) = {
            let mut state = self.state.write().await;
            let members = state.channels.entry(channel.clone()).or_default();
            members.insert(id, Arc::clone(&client));

            let mut user_ids = Vec::new();
            let mut clients = Vec::new();
            for (member_id, member) in members.iter() {
                if *member_id == id || member.connection_type() == client.connection_type() {
                    continue;
                }
                user_ids.push(*member_id);
                clients.push(member.info());
            }
            (user_ids, clients)
        };

        info!(
            client = %client.label(),
            channel = %channel,
            role = %client.connection_type(),
            "client joined channel"
        );
        client
            .send_msg(ServerMessage::ChannelJoined {
                channel,
                user_ids,
                clients,
            })
            .await;
    }

    /// Drop a client from its channel. An emptied channel is deleted and the
    /// departure broadcast skipped; otherwise the remaining members are told.
    /// Delete-then-broadcast, so the departing client never hears itself.
    pub async fn remove_client(&self, client: &Client) {
        let Some(channel) = client.channel() else {
            return;
        };
        let id = client.id();

        let emptied = {
            let mut state = self.state.write().await;
            let Some(members) = state.channels.get_mut(channel) else {
                return;
            };
            members.remove(&id);
            if members.is_empty() {
                state.channels.remove(channel);
                true
            } else {
                false
            }
        };

        if !emptied {
            match (ServerMessage::ClientLeft {
                user_id: id,
                client: client.info(),
            })
            .to_line()
            {
                Ok(line) => self.send_line_to_channel(client, &line, false).await,
                Err(err) => error!(client = %client.label(), %err, "failed to encode leave notice"),
            }
        }
        info!(client = %client.label(), channel = %channel, "client removed from channel");
    }

    /// Fan one line out to every channel member with a different ID and a
    /// different role than the sender. With `report_no_peer`, a controller
    /// whose line selected no recipient is told nothing is connected.
    /// Unknown channel: no-op.
    pub async fn send_line_to_channel(&self, sender: &Client, line: &[u8], report_no_peer: bool) {
        let Some(channel) = sender.channel() else {
            return;
        };
        let sender_id = sender.id();
        let sender_role = sender.connection_type();

        let mut selected = false;
        {
            let state = self.state.read().await;
            let Some(members) = state.channels.get(channel) else {
                return;
            };
            for (member_id, member) in members.iter() {
                if *member_id == sender_id || member.connection_type() == sender_role {
                    continue;
                }
                selected = true;
                // A failed enqueue means that peer's pump is closing; its own
                // teardown handles it. Escalating from under the read lock
                // would deadlock against the removal's write lock.
                if let Err(err) = member.enqueue_line(line.to_vec()).await {
                    debug!(client = %member.label(), %err, "dropping line for closing peer");
                }
            }
        }

        if !selected && report_no_peer && sender_role == ROLE_CONTROLLER {
            sender.send_msg(ServerMessage::NvdaNotConnected).await;
        }
    }

    /// Encode and fan out a decoded message, optionally stamping the
    /// sender's ID under `origin`. The stamping call is also the one that
    /// reports a missing peer.
    pub async fn send_msg_to_channel(&self, sender: &Client, mut msg: Msg, inject_origin: bool) {
        if inject_origin {
            msg.insert("origin".to_owned(), sender.id().0.into());
        }
        match serde_json::to_vec(&msg) {
            Ok(mut line) => {
                line.push(DELIMITER);
                self.send_line_to_channel(sender, &line, inject_origin).await;
            }
            Err(err) => error!(client = %sender.label(), %err, "failed to encode channel message"),
        }
    }

    /// Mint an 8-digit decimal key not currently used as a channel name.
    /// Loops until one is free; with realistic channel populations the first
    /// candidate nearly always wins.
    pub async fn generate_key(&self) -> String {
        loop {
            let key = rand::thread_rng()
                .gen_range(10_000_000u32..=99_999_999)
                .to_string();
            let state = self.state.read().await;
            if !state.channels.contains_key(&key) {
                return key;
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Registry {
    pub(crate) async fn channel_count(&self) -> usize {
        self.state.read().await.channels.len()
    }

    pub(crate) async fn members_of(&self, channel: &str) -> Vec<ClientId> {
        let state = self.state.read().await;
        let mut ids: Vec<ClientId> = state
            .channels
            .get(channel)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}
