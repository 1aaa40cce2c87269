//! Named queue connection service
//!
//! The broker stands between providers and consumers that share a queue
//! name. Each side gets an [`Endpoint`] with an inbox of encoded frames.
//! The broker itself announces arrivals and departures, so a provider
//! learns the consumer's queue size and preferred buffer size without asking.
//!
//! A queue link is created when the first endpoint attaches to its name and
//! removed once both sides have gone.

use crate::protocol::{Frame, Message};
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Consumer,
    Provider,
}

impl Role {
    fn peer(self) -> Role {
        match self {
            Role::Consumer => Role::Provider,
            Role::Provider => Role::Consumer,
        }
    }
}

/// What a consumer tells the broker when it attaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub queue_size: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Default)]
struct Link {
    consumer: Option<ConsumerInfo>,
    provider: bool,
    to_consumer: VecDeque<Frame>,
    to_provider: VecDeque<Frame>,
}

impl Link {
    fn present(&self, role: Role) -> bool {
        match role {
            Role::Consumer => self.consumer.is_some(),
            Role::Provider => self.provider,
        }
    }

    fn inbox(&mut self, role: Role) -> &mut VecDeque<Frame> {
        match role {
            Role::Consumer => &mut self.to_consumer,
            Role::Provider => &mut self.to_provider,
        }
    }

    fn push(&mut self, role: Role, message: &Message, fds: Vec<OwnedFd>) -> Result<()> {
        let frame = Frame::encode(message, fds)?;
        self.inbox(role).push_back(frame);
        Ok(())
    }
}

struct BrokerState {
    links: HashMap<String, Link>,
    connected: bool,
    exit_requested: bool,
}

/// Handle to the connection service; clones share it
#[derive(Clone)]
pub struct Broker {
    state: Rc<RefCell<BrokerState>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(BrokerState {
                links: HashMap::new(),
                connected: true,
                exit_requested: false,
            })),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Set once the service connection is gone
    pub fn exit_requested(&self) -> bool {
        self.state.borrow().exit_requested
    }

    /// Simulate loss of the service: every endpoint turns into a dead end
    pub fn connection_lost(&self) {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return;
        }
        error!("Lost connection to the buffer queue service");
        state.connected = false;
        state.exit_requested = true;
        state.links.clear();
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.borrow().links.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.state.borrow().links.len()
    }

    pub(crate) fn attach_consumer(&self, name: &str, info: ConsumerInfo) -> Result<Endpoint> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(Error::Disconnected);
        }
        let link = state.links.entry(name.to_string()).or_default();
        if link.consumer.is_some() {
            return Err(Error::EndpointTaken(name.to_string()));
        }
        link.consumer = Some(info);
        if link.provider {
            link.push(Role::Consumer, &Message::ProviderConnected, Vec::new())?;
            link.push(Role::Provider, &consumer_connected(info), Vec::new())?;
        }
        info!(
            "Consumer attached to queue '{}' (size {}, {}x{})",
            name, info.queue_size, info.width, info.height
        );
        Ok(Endpoint::new(self.clone(), name, Role::Consumer))
    }

    pub(crate) fn attach_provider(&self, name: &str) -> Result<Endpoint> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(Error::Disconnected);
        }
        let link = state.links.entry(name.to_string()).or_default();
        if link.provider {
            return Err(Error::EndpointTaken(name.to_string()));
        }
        link.provider = true;
        if let Some(info) = link.consumer {
            link.push(Role::Provider, &consumer_connected(info), Vec::new())?;
            link.push(Role::Consumer, &Message::ProviderConnected, Vec::new())?;
        }
        info!("Provider attached to queue '{}'", name);
        Ok(Endpoint::new(self.clone(), name, Role::Provider))
    }

    fn detach(&self, name: &str, role: Role) {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return;
        }
        let Some(link) = state.links.get_mut(name) else {
            return;
        };
        match role {
            Role::Consumer => link.consumer = None,
            Role::Provider => link.provider = false,
        }
        link.inbox(role).clear();

        let peer = role.peer();
        if link.present(peer) {
            let notice = match role {
                Role::Consumer => Message::ConsumerDisconnected,
                Role::Provider => Message::ProviderDisconnected,
            };
            if let Err(e) = link.push(peer, &notice, Vec::new()) {
                warn!("Failed to notify peer on '{}': {}", name, e);
            }
        } else {
            link.to_consumer.clear();
            link.to_provider.clear();
        }

        if !link.present(Role::Consumer) && !link.present(Role::Provider) {
            state.links.remove(name);
            debug!("Queue '{}' destroyed", name);
        }
    }
}

fn consumer_connected(info: ConsumerInfo) -> Message {
    Message::ConsumerConnected {
        queue_size: info.queue_size,
        width: info.width,
        height: info.height,
    }
}

/// One side of a named queue link; detaches on drop
pub struct Endpoint {
    broker: Broker,
    name: String,
    role: Role,
}

impl Endpoint {
    fn new(broker: Broker, name: &str, role: Role) -> Self {
        Self {
            broker,
            name: name.to_string(),
            role,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Whether the other side of this queue is attached
    pub fn peer_present(&self) -> bool {
        let state = self.broker.state.borrow();
        state
            .links
            .get(&self.name)
            .is_some_and(|link| link.present(self.role.peer()))
    }

    /// Queue a message for the peer; dropped silently if no peer is attached
    pub fn send(&self, message: &Message, fds: Vec<OwnedFd>) -> Result<()> {
        let mut state = self.broker.state.borrow_mut();
        if !state.connected {
            return Err(Error::Disconnected);
        }
        let link = state.links.get_mut(&self.name).ok_or(Error::Disconnected)?;
        let peer = self.role.peer();
        if !link.present(peer) {
            debug!("'{}': no peer for {}, dropped", self.name, message.name());
            return Ok(());
        }
        link.push(peer, message, fds)
    }

    /// Next message addressed to this endpoint
    pub fn recv(&self) -> Option<Result<(Message, Vec<OwnedFd>)>> {
        let frame = {
            let mut state = self.broker.state.borrow_mut();
            if !state.connected {
                return None;
            }
            state.links.get_mut(&self.name)?.inbox(self.role).pop_front()?
        };
        Some(frame.decode())
    }

    /// Consumer only: update the announced buffer size
    pub fn update_consumer_size(&self, width: u32, height: u32) -> Result<()> {
        {
            let mut state = self.broker.state.borrow_mut();
            if !state.connected {
                return Err(Error::Disconnected);
            }
            let link = state.links.get_mut(&self.name).ok_or(Error::Disconnected)?;
            if let Some(info) = link.consumer.as_mut() {
                info.width = width;
                info.height = height;
            }
        }
        self.send(&Message::BufferSize { width, height }, Vec::new())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.broker.detach(&self.name, self.role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ConsumerInfo {
        ConsumerInfo {
            queue_size: 3,
            width: 64,
            height: 48,
        }
    }

    fn drain(endpoint: &Endpoint) -> Vec<Message> {
        std::iter::from_fn(|| endpoint.recv())
            .map(|r| r.unwrap().0)
            .collect()
    }

    #[test]
    fn test_announces_both_ways() {
        let broker = Broker::new();
        let consumer = broker.attach_consumer("q", info()).unwrap();
        assert!(drain(&consumer).is_empty());

        let provider = broker.attach_provider("q").unwrap();
        assert_eq!(
            drain(&provider),
            vec![Message::ConsumerConnected {
                queue_size: 3,
                width: 64,
                height: 48
            }]
        );
        assert_eq!(drain(&consumer), vec![Message::ProviderConnected]);
        assert!(provider.peer_present());
    }

    #[test]
    fn test_second_endpoint_refused() {
        let broker = Broker::new();
        let _consumer = broker.attach_consumer("q", info()).unwrap();
        assert!(matches!(
            broker.attach_consumer("q", info()),
            Err(Error::EndpointTaken(_))
        ));
        let _provider = broker.attach_provider("q").unwrap();
        assert!(matches!(broker.attach_provider("q"), Err(Error::EndpointTaken(_))));
        // Different name, different queue
        assert!(broker.attach_provider("other").is_ok());
    }

    #[test]
    fn test_drop_notifies_and_removes_queue() {
        let broker = Broker::new();
        let consumer = broker.attach_consumer("q", info()).unwrap();
        let provider = broker.attach_provider("q").unwrap();
        drain(&consumer);
        drain(&provider);

        drop(provider);
        assert_eq!(drain(&consumer), vec![Message::ProviderDisconnected]);
        assert!(broker.queue_exists("q"));

        drop(consumer);
        assert!(!broker.queue_exists("q"));
    }

    #[test]
    fn test_send_without_peer_is_dropped() {
        let broker = Broker::new();
        let provider = broker.attach_provider("q").unwrap();
        provider
            .send(&Message::ProviderDisconnected, Vec::new())
            .unwrap();

        let consumer = broker.attach_consumer("q", info()).unwrap();
        assert_eq!(drain(&consumer), vec![Message::ProviderConnected]);
    }

    #[test]
    fn test_connection_lost() {
        let broker = Broker::new();
        let provider = broker.attach_provider("q").unwrap();
        assert!(!broker.exit_requested());

        broker.connection_lost();
        assert!(broker.exit_requested());
        assert!(!provider.is_connected());
        assert!(matches!(
            provider.send(&Message::ProviderConnected, Vec::new()),
            Err(Error::Disconnected)
        ));
        assert!(provider.recv().is_none());
        assert!(matches!(broker.attach_provider("r"), Err(Error::Disconnected)));
    }

    #[test]
    fn test_consumer_size_update() {
        let broker = Broker::new();
        let consumer = broker.attach_consumer("q", info()).unwrap();
        let provider = broker.attach_provider("q").unwrap();
        drain(&provider);

        consumer.update_consumer_size(128, 96).unwrap();
        assert_eq!(
            drain(&provider),
            vec![Message::BufferSize {
                width: 128,
                height: 96
            }]
        );
    }
}
