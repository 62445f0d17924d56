//! The libp2p node which carries signing requests to validator nodes and their responses back.

use std::{
    collections::{HashMap, HashSet},
    iter,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
    futures::StreamExt,
    identify,
    kad::{self, store::MemoryStore},
    multiaddr::Protocol,
    noise,
    request_response::{self, OutboundRequestId, ProtocolSupport},
    swarm::{NetworkBehaviour, SwarmEvent, dial_opts::DialOpts},
    tcp, yamux,
};
use tokio::{
    select,
    signal::{self, unix::SignalKind},
    sync::mpsc::{self, UnboundedSender},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    cfg::Config,
    crypto::SecretKey,
    message::{ExternalMessage, SignatureResponse},
    peers::{PeerCommand, PeerNetwork},
};

#[derive(NetworkBehaviour)]
struct Behaviour {
    request_response: request_response::cbor::Behaviour<ExternalMessage, ExternalMessage>,
    identify: identify::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
}

/// Attributes a response to the round which issued the request, not to whatever round the
/// payload claims. A mismatched or malformed payload is still that node's one reply and is
/// delivered as an error, so the round can count it.
fn reconcile_response(round: u32, source: PeerId, message: ExternalMessage) -> SignatureResponse {
    match message {
        ExternalMessage::SignatureResponse(response) if response.request_id == round => response,
        ExternalMessage::SignatureResponse(response) => {
            warn!(%source, claimed = response.request_id, round, "response claims a round it does not answer");
            SignatureResponse {
                request_id: round,
                signature: None,
                error: Some("mismatched request id".to_owned()),
            }
        }
        other => {
            warn!(%source, message = %other, "unexpected response type");
            SignatureResponse {
                request_id: round,
                signature: None,
                error: Some(format!("unexpected response: {other}")),
            }
        }
    }
}

pub struct P2pNode {
    peer_id: PeerId,
    p2p_port: u16,
    swarm: Swarm<Behaviour>,
    bootstrap_address: Option<(PeerId, Multiaddr)>,
    /// [PeerNetwork] gets a copy of a handle to this sender, to issue dials and requests.
    command_sender: UnboundedSender<PeerCommand>,
    /// The p2p node keeps a handle to this receiver, to act on those commands.
    command_receiver: UnboundedReceiverStream<PeerCommand>,
    /// Live connections, shared with [PeerNetwork] so connection checks need no round-trip
    /// through the event loop.
    connected: Arc<Mutex<HashSet<PeerId>>>,
    /// Outstanding outbound requests, mapped back to the signing round which issued them so
    /// transport failures can be attributed.
    pending_requests: HashMap<OutboundRequestId, u32>,
}

impl P2pNode {
    pub fn new(secret_key: SecretKey, config: &Config) -> Result<Self> {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let command_receiver = UnboundedReceiverStream::new(command_receiver);

        let key_pair = secret_key.to_libp2p_keypair();
        let peer_id = PeerId::from(key_pair.public());
        info!(%peer_id);

        let swarm = SwarmBuilder::with_existing_identity(key_pair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_dns()?
            .with_behaviour(|key_pair| Behaviour {
                request_response: request_response::cbor::Behaviour::new(
                    iter::once((StreamProtocol::new("/sig-agg/1"), ProtocolSupport::Full)),
                    Default::default(),
                ),
                identify: identify::Behaviour::new(identify::Config::new(
                    "/ipfs/id/1.0.0".to_owned(),
                    key_pair.public(),
                )),
                kademlia: kad::Behaviour::new(peer_id, MemoryStore::new(peer_id)),
            })?
            .build();

        Ok(Self {
            peer_id,
            p2p_port: config.p2p_port,
            swarm,
            bootstrap_address: config.bootstrap_address.clone(),
            command_sender,
            command_receiver,
            connected: Arc::new(Mutex::new(HashSet::new())),
            pending_requests: HashMap::new(),
        })
    }

    pub fn command_sender(&self) -> UnboundedSender<PeerCommand> {
        self.command_sender.clone()
    }

    pub fn connected(&self) -> Arc<Mutex<HashSet<PeerId>>> {
        self.connected.clone()
    }

    pub async fn run(mut self, network: Arc<PeerNetwork>) -> Result<()> {
        let mut addr: Multiaddr = "/ip4/0.0.0.0".parse()?;
        addr.push(Protocol::Tcp(self.p2p_port));

        self.swarm.listen_on(addr)?;

        if let Some((peer, address)) = &self.bootstrap_address {
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(peer, address.clone());
            self.swarm.behaviour_mut().kademlia.bootstrap()?;
        }

        let mut terminate = signal::unix::signal(SignalKind::terminate())?;

        loop {
            select! {
                event = self.swarm.next() => match event.expect("swarm stream should be infinite") {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(%address, "started listening");
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                        debug!(%peer_id, "connection established");
                        self.connected.lock().unwrap().insert(peer_id);
                    }
                    SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                        if num_established == 0 {
                            debug!(%peer_id, "connection closed");
                            self.connected.lock().unwrap().remove(&peer_id);
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { info: identify::Info { observed_addr, listen_addrs, .. }, peer_id, .. })) => {
                        for addr in listen_addrs {
                            debug!(%peer_id, %addr, "identity info received");
                            self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                        }
                        // Mark the address observed for us by the external peer as confirmed.
                        self.swarm.add_external_address(observed_addr);
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(request_response::Event::Message { peer: source, message, .. })) => {
                        match message {
                            request_response::Message::Request { request, channel, .. } => {
                                // We collect signatures, we do not produce them.
                                debug!(%source, message = %request, "refusing inbound request");
                                let _ = self.swarm.behaviour_mut().request_response.send_response(channel, ExternalMessage::SignatureResponse(SignatureResponse {
                                    request_id: request.request_id(),
                                    signature: None,
                                    error: Some("this node does not serve signing requests".to_owned()),
                                }));
                            }
                            request_response::Message::Response { request_id, response } => {
                                match self.pending_requests.remove(&request_id) {
                                    Some(round) => {
                                        debug!(%source, round, "response received");
                                        network.deliver(source, reconcile_response(round, source, response));
                                    }
                                    None => {
                                        warn!(%source, "response with no matching outbound request");
                                    }
                                }
                            }
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(request_response::Event::OutboundFailure { peer, request_id, error, .. })) => {
                        // Surface the failure to the waiting round as a response, so it can tell
                        // a failed peer apart from a silent one.
                        if let Some(round) = self.pending_requests.remove(&request_id) {
                            debug!(%peer, round, %error, "outbound request failed");
                            network.deliver(peer, SignatureResponse {
                                request_id: round,
                                signature: None,
                                error: Some(format!("request failed: {error}")),
                            });
                        }
                    }
                    _ => {},
                },
                command = self.command_receiver.next() => {
                    let command = command.expect("command stream should be infinite");
                    match command {
                        PeerCommand::Dial(peer, address) => {
                            if peer == self.peer_id {
                                continue;
                            }
                            self.swarm.behaviour_mut().kademlia.add_address(&peer, address.clone());
                            if let Err(e) = self.swarm.dial(DialOpts::peer_id(peer).addresses(vec![address]).build()) {
                                debug!(%peer, %e, "dial failed");
                            }
                        }
                        PeerCommand::SendRequest(peer, message) => {
                            let round = message.request_id();
                            debug!(%peer, message_type = message.name(), round, "sending request");
                            let request_id = self.swarm.behaviour_mut().request_response.send_request(&peer, message);
                            self.pending_requests.insert(request_id, round);
                        }
                    }
                },
                _ = terminate.recv() => {
                    break;
                },
                _ = signal::ctrl_c() => {
                    break;
                },
            }
        }
        Ok(())
    }
}
