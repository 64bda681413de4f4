use futures::channel::{mpsc, oneshot};
use futures::prelude::*;

use libp2p::identify;
use libp2p::multiaddr::Protocol;
use libp2p::{
    kad,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::{Swarm, SwarmEvent},
    PeerId,
};

use std::collections::{HashMap, HashSet};
use std::error::Error;
use tracing::{debug, warn};

use crate::command::command_handler;
use crate::command::Command;
use crate::network::{Behaviour, BehaviourEvent};
use crate::protocol::{AssignShardResponse, Request, Response};
use crate::shard::Shard;

type Reply<T> = oneshot::Sender<Result<T, Box<dyn Error + Send>>>;

/// Events surfaced to the node from the network.
///
/// Only inbound requests leave the event loop: a holder answers them through `channel`.
///
/// ```ignore
/// match event {
///     Event::InboundRequest { request, channel } => {
///         // answer through client.respond_*(.., channel)
///     },
/// }
/// ```
#[derive(Debug)]
pub enum Event {
    InboundRequest {
        request: Request,
        channel: ResponseChannel<Response>,
    },
}

/// Drives the swarm and the command channel.
///
/// Every outstanding query or request is parked in one of the `pending_*` maps until the swarm
/// reports its outcome, at which point the waiting client call is answered. Provider lookups
/// stay parked across steps and forward every batch of providers they find.
pub struct EventLoop {
    pub swarm: Swarm<Behaviour>,
    pub command_receiver: mpsc::Receiver<Command>,
    pub event_sender: mpsc::Sender<Event>,
    pub pending_dial: HashMap<PeerId, Reply<()>>,
    pub pending_start_providing: HashMap<kad::QueryId, oneshot::Sender<()>>,
    pub pending_get_providers: HashMap<kad::QueryId, mpsc::UnboundedSender<HashSet<PeerId>>>,
    pub pending_assign_shard: HashMap<OutboundRequestId, Reply<AssignShardResponse>>,
    pub pending_get_shard: HashMap<OutboundRequestId, Reply<Option<Shard>>>,
}

impl EventLoop {
    pub fn new(
        swarm: Swarm<Behaviour>,
        command_receiver: mpsc::Receiver<Command>,
        event_sender: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            swarm,
            command_receiver,
            event_sender,
            pending_dial: Default::default(),
            pending_start_providing: Default::default(),
            pending_get_providers: Default::default(),
            pending_assign_shard: Default::default(),
            pending_get_shard: Default::default(),
        }
    }

    /// Runs until either the swarm or the command channel is exhausted.
    pub async fn run(mut self) {
        loop {
            futures::select! {
                event = self.swarm.next() => match event {
                    Some(e) => self.handle_event(e).await,
                    None => return,
                },
                command = self.command_receiver.next() => match command {
                    Some(c) => command_handler(&mut self, c).await,
                    // every client handle is gone
                    None => return,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(BehaviourEvent::Kademlia(e)) => self.on_kademlia(e),
            SwarmEvent::Behaviour(BehaviourEvent::Identify(e)) => self.on_identify(e),
            SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(e)) => {
                self.on_request_response(e).await
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                let local_peer_id = *self.swarm.local_peer_id();
                debug!(
                    "Local node is listening on {:?}",
                    address.with(Protocol::P2p(local_peer_id))
                );
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                if endpoint.is_dialer() {
                    if let Some(sender) = self.pending_dial.remove(&peer_id) {
                        let _ = sender.send(Ok(()));
                    }
                }
                let _ = self.swarm.behaviour_mut().kademlia.bootstrap();
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if let Some(sender) = self.pending_dial.remove(&peer_id) {
                    let _ = sender.send(Err(Box::new(error)));
                }
            }
            SwarmEvent::IncomingConnection { .. }
            | SwarmEvent::ConnectionClosed { .. }
            | SwarmEvent::IncomingConnectionError { .. }
            | SwarmEvent::Dialing { .. } => {}
            e => debug!("unhandled swarm event: {e:?}"),
        }
    }

    fn on_kademlia(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::StartProviding(result),
                ..
            } => {
                if let Err(e) = result {
                    warn!("Could not announce provider record: {e:?}");
                }
                if let Some(sender) = self.pending_start_providing.remove(&id) {
                    let _ = sender.send(());
                }
            }
            kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetProviders(result),
                step,
                ..
            } => {
                let mut finished = step.last;
                match result {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        let delivered = self
                            .pending_get_providers
                            .get(&id)
                            .is_some_and(|sender| sender.unbounded_send(providers).is_ok());
                        if !delivered {
                            // nobody is listening any more
                            if let Some(mut query) =
                                self.swarm.behaviour_mut().kademlia.query_mut(&id)
                            {
                                query.finish();
                            }
                            finished = true;
                        }
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {
                        finished = true;
                    }
                    Err(e) => {
                        debug!("Provider lookup failed: {e:?}");
                        finished = true;
                    }
                }
                // dropping the sender ends the caller's stream of batches
                if finished {
                    self.pending_get_providers.remove(&id);
                }
            }
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                let address = addresses.first().to_owned();
                debug!("Routing table now holds {peer} at {address}");
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer, address);
                let _ = self.swarm.behaviour_mut().kademlia.bootstrap();
            }
            _ => {}
        }
    }

    fn on_identify(&mut self, event: identify::Event) {
        debug!("Identify message: {event:?}");
        if let identify::Event::Received {
            peer_id,
            info:
                identify::Info {
                    listen_addrs,
                    protocols,
                    observed_addr,
                    ..
                },
        } = event
        {
            self.swarm.add_external_address(observed_addr);

            if protocols.iter().any(|p| *p == kad::PROTOCOL_NAME) {
                let kademlia = &mut self.swarm.behaviour_mut().kademlia;
                for addr in listen_addrs {
                    kademlia.add_address(&peer_id, addr);
                }
            }
        }
        let _ = self.swarm.behaviour_mut().kademlia.bootstrap();
    }

    async fn on_request_response(&mut self, event: request_response::Event<Request, Response>) {
        match event {
            request_response::Event::Message {
                message: request_response::Message::Request {
                    request, channel, ..
                },
                ..
            } => {
                debug!("Inbound request: {request:?}");
                if self
                    .event_sender
                    .send(Event::InboundRequest { request, channel })
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, inbound request discarded");
                }
            }
            request_response::Event::Message {
                message:
                    request_response::Message::Response {
                        request_id,
                        response,
                    },
                ..
            } => match response {
                Response::AssignShard(res) => {
                    debug!("Holder answered assignment {request_id}: {}", res.success);
                    if let Some(sender) = self.pending_assign_shard.remove(&request_id) {
                        let _ = sender.send(Ok(res));
                    }
                }
                Response::GetShard(res) => {
                    debug!("Holder answered shard request {request_id}");
                    if let Some(sender) = self.pending_get_shard.remove(&request_id) {
                        let _ = sender.send(Ok(res.shard));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                debug!("Request to {peer} failed: {error}");
                if let Some(sender) = self.pending_assign_shard.remove(&request_id) {
                    let _ = sender.send(Err(Box::new(error)));
                } else if let Some(sender) = self.pending_get_shard.remove(&request_id) {
                    let _ = sender.send(Err(Box::new(error)));
                }
            }
            request_response::Event::InboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                debug!("Inbound request {request_id} from {peer} failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}
