//! Topic handling for one device
//!
//! Every device owns a fixed topic set below `<topic_prefix>/<protocol>/<id>`:
//! `state`, `attributes` and `presence` (all retained) plus the command topics
//! it registers. State and attributes are published only when they differ
//! structurally from the last published value.

use crate::devices::context::DeviceContext;
use crate::domain::error::Result;
use crate::domain::models::ControlPayload;
use crate::infrastructure::mqtt::SharedTransport;
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;
use tracing::{debug, warn};

/// A retained discovery document
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryEntry {
    pub topic: String,
    pub payload: Value,
}

pub struct TopicHandler {
    transport: SharedTransport,
    friendly_name: String,
    base: String,
    discovery_prefix: String,
    commands: Vec<String>,
    last_state: Mutex<Option<Value>>,
    last_attributes: Mutex<Option<Value>>,
}

impl TopicHandler {
    pub fn new(ctx: &DeviceContext, protocol_prefix: &str) -> Self {
        Self {
            transport: ctx.transport.clone(),
            friendly_name: ctx.friendly_name.clone(),
            base: format!("{}/{}/{}", ctx.topic_prefix, protocol_prefix, ctx.id),
            discovery_prefix: ctx.discovery_prefix.clone(),
            commands: Vec::new(),
            last_state: Mutex::new(None),
            last_attributes: Mutex::new(None),
        }
    }

    /// Register a command topic `<base>/<suffix>`
    pub fn register_command(&mut self, suffix: &str) {
        self.commands.push(suffix.to_string());
    }

    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.base, suffix)
    }

    pub fn state_topic(&self) -> String {
        self.topic("state")
    }

    pub fn attributes_topic(&self) -> String {
        self.topic("attributes")
    }

    pub fn presence_topic(&self) -> String {
        self.topic("presence")
    }

    /// `<discovery_prefix>/<component>/<object_id>/config`
    pub fn discovery_topic(&self, component: &str, object_id: &str) -> String {
        format!("{}/{}/{}/config", self.discovery_prefix, component, object_id)
    }

    /// The registered command suffix a topic addresses, if any
    pub fn command_for(&self, topic: &str) -> Option<&str> {
        let suffix = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        self.commands
            .iter()
            .find(|command| command.as_str() == suffix)
            .map(String::as_str)
    }

    /// Publish discovery documents, then subscribe to every command topic
    pub async fn initialize(&self, discovery: &[DiscoveryEntry]) -> Result<()> {
        for entry in discovery {
            self.transport
                .publish(&entry.topic, serde_json::to_string(&entry.payload)?, true)
                .await?;
        }

        if !self.commands.is_empty() {
            let topics: Vec<String> = self.commands.iter().map(|c| self.topic(c)).collect();
            self.transport.subscribe(&topics).await?;
        }
        Ok(())
    }

    /// Decode and dispatch an inbound message.
    ///
    /// Returns the addressed command and its payload, or `None` for topics
    /// this handler did not register.
    pub fn handle_message(&self, topic: &str, payload: &str) -> Option<(String, ControlPayload)> {
        let command = self.command_for(topic)?;
        Some((command.to_string(), ControlPayload::parse(payload)))
    }

    /// Publish the state unless it equals the last published one.
    ///
    /// Returns whether a publish happened.
    pub async fn publish_state<T: Serialize>(&self, state: &T) -> Result<bool> {
        let value = serde_json::to_value(state)?;
        let payload = serde_json::to_string(&value)?;
        self.publish_if_changed(&self.last_state, value, &self.state_topic(), payload)
            .await
    }

    /// Publish a plain (non JSON) state payload, with the same suppression
    pub async fn publish_raw_state(&self, payload: String) -> Result<bool> {
        let value = Value::String(payload.clone());
        self.publish_if_changed(&self.last_state, value, &self.state_topic(), payload)
            .await
    }

    pub async fn publish_attributes<T: Serialize>(&self, attributes: &T) -> Result<bool> {
        let value = serde_json::to_value(attributes)?;
        let payload = serde_json::to_string(&value)?;
        self.publish_if_changed(
            &self.last_attributes,
            value,
            &self.attributes_topic(),
            payload,
        )
        .await
    }

    async fn publish_if_changed(
        &self,
        last: &Mutex<Option<Value>>,
        value: Value,
        topic: &str,
        payload: String,
    ) -> Result<bool> {
        {
            let mut last = match last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.as_ref() == Some(&value) {
                debug!("Unchanged payload for {}, not publishing", topic);
                return Ok(false);
            }
            *last = Some(value);
        }

        if let Err(e) = self.transport.publish(topic, payload, true).await {
            // Forget the fingerprint so the next identical reading is retried
            if let Ok(mut last) = last.lock() {
                *last = None;
            }
            return Err(e.into());
        }
        Ok(true)
    }

    /// Publish `online` / `offline` to the presence topic; failures are logged
    pub async fn update_presence(&self, present: bool) {
        let payload = if present { "online" } else { "offline" };
        if let Err(e) = self
            .transport
            .publish(&self.presence_topic(), payload.to_string(), true)
            .await
        {
            warn!(
                "Failed to publish presence of {}: {}",
                self.friendly_name, e
            );
        }
    }

    /// Forget the fingerprints so the next state is always published
    pub fn reset(&self) {
        for last in [&self.last_state, &self.last_attributes] {
            if let Ok(mut last) = last.lock() {
                *last = None;
            }
        }
    }
}
