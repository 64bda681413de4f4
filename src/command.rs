use futures::channel::{mpsc, oneshot};
use libp2p::request_response::ResponseChannel;
use libp2p::{core::Multiaddr, multiaddr::Protocol, PeerId};

use crate::event::EventLoop;
use crate::protocol::{
    AssignShardRequest, AssignShardResponse, GetShardRequest, GetShardResponse, Request, Response,
};
use crate::document::DocumentHash;
use crate::shard::Shard;
use std::collections::{hash_map, HashSet};
use std::error::Error;
use tracing::{debug, warn};

/// Represents commands that can be issued to the network.
///
/// Every command that expects an answer carries a oneshot sender; the event loop completes it
/// when the swarm reports the outcome.
///
/// # Variants
///
/// * `StartListening` - Command to start listening on a specified address.
/// * `Dial` - Command to dial a specific peer.
/// * `StartProviding` - Command to announce the local node as a provider of a key in the Kademlia DHT.
/// * `GetProviders` - Command to stream the providers of a key in the DHT, one batch per query step.
/// * `RequestAssignShard` - Command to hand a shard to its holder.
/// * `RespondAssignShard` - Command to answer an assignment.
/// * `RequestGetShard` - Command to fetch a holder's signed shard.
/// * `RespondGetShard` - Command to answer a shard request.
#[derive(Debug)]
pub enum Command {
    StartListening {
        addr: Multiaddr,
        sender: oneshot::Sender<Result<(), Box<dyn Error + Send>>>,
    },
    Dial {
        peer_id: PeerId,
        peer_addr: Multiaddr,
        sender: oneshot::Sender<Result<(), Box<dyn Error + Send>>>,
    },
    StartProviding {
        key: String,
        sender: oneshot::Sender<()>,
    },
    GetProviders {
        key: String,
        sender: mpsc::UnboundedSender<HashSet<PeerId>>,
    },
    RequestAssignShard {
        shard: Shard,
        peer: PeerId,
        sender: PeerId,
        sender_chan: oneshot::Sender<Result<AssignShardResponse, Box<dyn Error + Send>>>,
    },
    RespondAssignShard {
        success: bool,
        signature: Option<Vec<u8>>,
        channel: ResponseChannel<Response>,
    },
    RequestGetShard {
        document_hash: DocumentHash,
        peer: PeerId,
        sender: PeerId,
        sender_chan: oneshot::Sender<Result<Option<Shard>, Box<dyn Error + Send>>>,
    },
    RespondGetShard {
        shard: Option<Shard>,
        channel: ResponseChannel<Response>,
    },
}

/// Handles incoming commands for the network event loop.
///
/// # Examples
///
/// ```ignore
/// command_handler(&mut eventloop, command).await;
/// ```
pub async fn command_handler(eventloop: &mut EventLoop, command: Command) {
    match command {
        Command::StartListening { addr, sender } => {
            let _ = match eventloop.swarm.listen_on(addr) {
                Ok(_) => sender.send(Ok(())),
                Err(e) => sender.send(Err(Box::new(e))),
            };
        }
        Command::Dial {
            peer_id,
            peer_addr,
            sender,
        } => {
            match eventloop.pending_dial.entry(peer_id) {
                hash_map::Entry::Vacant(e) => {
                    eventloop
                        .swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, peer_addr.clone());
                    match eventloop.swarm.dial(peer_addr.with(Protocol::P2p(peer_id))) {
                        Ok(()) => {
                            e.insert(sender);
                        }
                        Err(e) => {
                            let _ = sender.send(Err(Box::new(e)));
                        }
                    }
                }
                hash_map::Entry::Occupied(_) => {
                    debug!("Already dialing peer {peer_id}");
                    let _ = sender.send(Ok(()));
                }
            }

            // refresh the routing table
            let _ = eventloop.swarm.behaviour_mut().kademlia.bootstrap();
        }
        Command::StartProviding { key, sender } => {
            match eventloop
                .swarm
                .behaviour_mut()
                .kademlia
                .start_providing(key.into_bytes().into())
            {
                Ok(query_id) => {
                    eventloop.pending_start_providing.insert(query_id, sender);
                }
                Err(e) => {
                    warn!("Failed to start providing: {e:?}");
                    let _ = sender.send(());
                }
            }
        }
        Command::GetProviders { key, sender } => {
            let query_id = eventloop
                .swarm
                .behaviour_mut()
                .kademlia
                .get_providers(key.into_bytes().into());
            eventloop.pending_get_providers.insert(query_id, sender);
        }
        Command::RequestAssignShard {
            shard,
            peer,
            sender,
            sender_chan,
        } => {
            debug!("Sending shard {} to {}.", shard.key(), peer);
            let request_id = eventloop
                .swarm
                .behaviour_mut()
                .request_response
                .send_request(
                    &peer,
                    Request::AssignShard(AssignShardRequest {
                        shard,
                        sender: sender.into(),
                    }),
                );
            eventloop
                .pending_assign_shard
                .insert(request_id, sender_chan);
        }
        Command::RespondAssignShard {
            success,
            signature,
            channel,
        } => {
            if eventloop
                .swarm
                .behaviour_mut()
                .request_response
                .send_response(
                    channel,
                    Response::AssignShard(AssignShardResponse { success, signature }),
                )
                .is_err()
            {
                warn!("Connection closed before the assignment response was sent");
            }
        }
        Command::RequestGetShard {
            document_hash,
            peer,
            sender,
            sender_chan,
        } => {
            let request_id = eventloop
                .swarm
                .behaviour_mut()
                .request_response
                .send_request(
                    &peer,
                    Request::GetShard(GetShardRequest {
                        document_hash,
                        sender: sender.into(),
                    }),
                );
            eventloop.pending_get_shard.insert(request_id, sender_chan);
        }
        Command::RespondGetShard { shard, channel } => {
            if eventloop
                .swarm
                .behaviour_mut()
                .request_response
                .send_response(channel, Response::GetShard(GetShardResponse { shard }))
                .is_err()
            {
                warn!("Connection closed before the shard was sent");
            }
        }
    }
}
