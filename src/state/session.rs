//! Recorded state of one session and its children.

use std::collections::HashMap;

use crate::{
    command::{ConsumerId, ConsumerInfo, ProducerId, ProducerInfo, SessionInfo},
    error::{Result, WirebusError},
};

/// The registration command needed to re-create a producer on reconnect.
#[derive(Clone, Debug)]
pub struct ProducerState {
    pub info: ProducerInfo,
}

/// The registration command needed to re-create a consumer on reconnect.
#[derive(Clone, Debug)]
pub struct ConsumerState {
    pub info: ConsumerInfo,
}

/// Session node of the connection state tree.
#[derive(Debug)]
pub struct SessionState {
    info: SessionInfo,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    shutdown: bool,
}

impl SessionState {
    #[must_use]
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            shutdown: false,
        }
    }

    #[must_use]
    pub fn info(&self) -> &SessionInfo { &self.info }

    /// Record a consumer registration.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after [`shutdown`](Self::shutdown).
    pub fn add_consumer(&mut self, info: ConsumerInfo) -> Result<()> {
        self.check_shutdown()?;
        self.consumers
            .insert(info.consumer_id.clone(), ConsumerState { info });
        Ok(())
    }

    pub fn remove_consumer(&mut self, id: &ConsumerId) -> Option<ConsumerState> {
        self.consumers.remove(id)
    }

    /// Record a producer registration.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::Disposed`] after [`shutdown`](Self::shutdown).
    pub fn add_producer(&mut self, info: ProducerInfo) -> Result<()> {
        self.check_shutdown()?;
        self.producers
            .insert(info.producer_id.clone(), ProducerState { info });
        Ok(())
    }

    pub fn remove_producer(&mut self, id: &ProducerId) -> Option<ProducerState> {
        self.producers.remove(id)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerState> { self.consumers.values() }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerState> { self.producers.values() }

    #[must_use]
    pub fn consumer_count(&self) -> usize { self.consumers.len() }

    #[must_use]
    pub fn producer_count(&self) -> usize { self.producers.len() }

    pub fn shutdown(&mut self) { self.shutdown = true; }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown {
            Err(WirebusError::Disposed("session state"))
        } else {
            Ok(())
        }
    }
}
