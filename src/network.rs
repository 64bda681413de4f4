use crate::client::Client;
use crate::constants::{IDENTIFY_PROTOCOL, REQRES_PROTOCOL, REQUEST_TIMEOUT_SECONDS};
use crate::event::{Event, EventLoop};
use crate::protocol::{Request, Response};

use futures::channel::mpsc;
use futures::prelude::*;

use libp2p::request_response::ProtocolSupport;
use libp2p::{
    identify, identity, kad, noise, request_response, swarm::NetworkBehaviour, tcp, yamux,
    PeerId, StreamProtocol,
};
use std::error::Error;
use std::time::Duration;
use tracing::debug;

/// The behaviours a docshard node runs.
///
/// Holders announce the hex hash of every document they keep a shard of as a Kademlia provider
/// record; combiners look those records up and then talk to the holders over CBOR
/// request/response.
#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub request_response: request_response::cbor::Behaviour<Request, Response>,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
}

impl Behaviour {
    fn new(key: &identity::Keypair) -> Self {
        let peer_id = key.public().to_peer_id();

        let mut kad_config = kad::Config::default();
        kad_config.set_query_timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS * 6));
        let kademlia = kad::Behaviour::with_config(
            peer_id,
            kad::store::MemoryStore::new(peer_id),
            kad_config,
        );

        let request_response = request_response::cbor::Behaviour::new(
            [(StreamProtocol::new(REQRES_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default()
                .with_request_timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS)),
        );

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            key.public(),
        ));

        Behaviour {
            request_response,
            kademlia,
            identify,
        }
    }
}

/// Builds the swarm for `id_keys`.
///
/// Returns the client handle, the stream of inbound requests and the event loop, which the
/// caller must spawn:
///
/// ```ignore
/// let (client, events, event_loop) = network::new(config.key()?).await?;
/// tokio::spawn(event_loop.run());
/// ```
pub async fn new(
    id_keys: identity::Keypair,
) -> Result<(Client, impl Stream<Item = Event>, EventLoop), Box<dyn Error>> {
    let peer_id: PeerId = id_keys.public().to_peer_id();
    debug!("Peer ID: {}", peer_id);

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(id_keys)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| Behaviour::new(key))?
        .build();

    // holders must answer provider lookups even behind an unconfirmed address
    swarm
        .behaviour_mut()
        .kademlia
        .set_mode(Some(kad::Mode::Server));

    let (command_sender, command_receiver) = mpsc::channel(0);
    let (event_sender, event_receiver) = mpsc::channel(0);

    Ok((
        Client {
            sender: command_sender,
            peer_id,
        },
        event_receiver,
        EventLoop::new(swarm, command_receiver, event_sender),
    ))
}
