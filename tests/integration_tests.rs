// tests/integration_tests.rs
//! End-to-end ICE scenarios over the in-memory network
//!
//! Agents use the literal LAN addresses 192.168.1.5 and 192.168.1.6; STUN
//! and TURN servers are small fakes bound on the same network. Nothing here
//! touches the host network.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, timeout};
use tracing::info;

use sharp_ice::nat::net::MemorySocket;
use sharp_ice::nat::stun::{
    decode_channel_data, encode_channel_data, is_channel_data, Attribute, AttributeType, Message, MessageClass,
    MessageType, TransactionId,
};
use sharp_ice::nat::turn::long_term_key;
use sharp_ice::{
    from_sdp, to_sdp, CandidatePairState, CandidateType, DatagramSocket, IceAgent, IceConfig, IceEvent, IceRole, IceState,
    MemoryNetwork, NatError, NatResult, StunServerConfig, TurnServerConfig,
};

const ALICE_IP: &str = "192.168.1.5";
const BOB_IP: &str = "192.168.1.6";

/// Route agent logs through the test harness; `RUST_LOG` overrides the level
fn setup_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sharp_ice=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn fast_config(role: IceRole) -> IceConfig {
    IceConfig {
        role,
        check_timeout_ms: 100,
        check_retries: 4,
        connectivity_check_timeout_ms: 3000,
        nomination_timeout_ms: 1000,
        ..Default::default()
    }
}

fn agent_on(net: &MemoryNetwork, addr: &str, config: IceConfig) -> NatResult<IceAgent> {
    IceAgent::with_platform(config, net.platform(&[ip(addr)]))
}

fn record_events(agent: &IceAgent) -> Arc<Mutex<Vec<IceEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    agent.set_event_callback(Arc::new(move |event| sink.lock().push(event)));
    events
}

/// Hand `from`'s candidates (through their SDP form) and credentials to `to`
fn signal(from: &IceAgent, to: &IceAgent) -> NatResult<()> {
    for candidate in from.get_local_candidates() {
        to.add_remote_candidate(from_sdp(&to_sdp(&candidate))?)?;
    }
    let credentials = from.get_local_credentials();
    to.set_remote_credentials(&credentials.ufrag, &credentials.pwd)
}

async fn wait_for_state(agent: &IceAgent, state: IceState, limit: Duration) -> bool {
    timeout(limit, async {
        while agent.get_state() != state {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

async fn connect_pair(alice: &IceAgent, bob: &IceAgent) -> NatResult<()> {
    alice.gather_candidates().await?;
    bob.gather_candidates().await?;
    signal(alice, bob)?;
    signal(bob, alice)?;
    alice.start_checks()?;
    bob.start_checks()?;
    Ok(())
}

fn state_changes(events: &[IceEvent]) -> Vec<IceState> {
    events
        .iter()
        .filter_map(|e| match e {
            IceEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

fn selections(events: &[IceEvent]) -> usize {
    events.iter().filter(|e| matches!(e, IceEvent::PairSelected { .. })).count()
}

#[tokio::test]
async fn test_host_to_host_connects_and_exchanges_data() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let alice = agent_on(&net, ALICE_IP, fast_config(IceRole::Controlling))?;
    let bob = agent_on(&net, BOB_IP, fast_config(IceRole::Controlled))?;
    let alice_events = record_events(&alice);
    let bob_events = record_events(&bob);

    connect_pair(&alice, &bob).await?;

    assert!(wait_for_state(&alice, IceState::Completed, Duration::from_secs(5)).await);
    assert!(wait_for_state(&bob, IceState::Completed, Duration::from_secs(5)).await);

    let selected = alice.get_selected_pair().unwrap();
    assert_eq!(selected.local.addr, "192.168.1.5:50000".parse::<SocketAddr>().unwrap());
    assert_eq!(selected.remote.addr, "192.168.1.6:50000".parse::<SocketAddr>().unwrap());
    assert!(selected.nominated);
    let bob_selected = bob.get_selected_pair().unwrap();
    assert_eq!(bob_selected.local.addr, selected.remote.addr);
    assert_eq!(bob_selected.remote.addr, selected.local.addr);

    {
        let events = alice_events.lock();
        assert_eq!(
            state_changes(&events),
            vec![IceState::Gathering, IceState::Checking, IceState::Connected, IceState::Completed]
        );
        assert_eq!(selections(&events), 1);
        assert!(events.contains(&IceEvent::GatheringComplete));
        assert_eq!(selections(&bob_events.lock()), 1);
    }

    alice.send(1, b"hello bob").await?;
    let delivered = timeout(Duration::from_secs(2), async {
        loop {
            let found = bob_events.lock().iter().find_map(|e| match e {
                IceEvent::Data { component_id, from, payload } => Some((*component_id, *from, payload.clone())),
                _ => None,
            });
            if let Some(found) = found {
                return found;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("data not delivered");
    assert_eq!(delivered.0, 1);
    assert_eq!(delivered.1, selected.local.addr);
    assert_eq!(&delivered.2[..], b"hello bob");

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_two_components() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let config = |role| IceConfig { components: 2, ..fast_config(role) };
    let alice = agent_on(&net, ALICE_IP, config(IceRole::Controlling))?;
    let bob = agent_on(&net, BOB_IP, config(IceRole::Controlled))?;
    let alice_events = record_events(&alice);

    connect_pair(&alice, &bob).await?;
    assert!(wait_for_state(&alice, IceState::Completed, Duration::from_secs(5)).await);
    assert!(wait_for_state(&bob, IceState::Completed, Duration::from_secs(5)).await);

    let rtp = alice.get_selected_pair_for(1).unwrap();
    let rtcp = alice.get_selected_pair_for(2).unwrap();
    assert_eq!(rtp.local.component_id, 1);
    assert_eq!(rtcp.local.component_id, 2);
    assert_eq!(rtcp.local.addr.port(), 50001);
    assert_eq!(selections(&alice_events.lock()), 2);

    // Datagrams handed in from outside are attributed by their source
    alice.process_incoming(b"rtcp-payload", rtcp.remote.addr)?;
    alice.process_incoming(b"rtp-payload", rtp.remote.addr)?;
    let delivered = timeout(Duration::from_secs(2), async {
        loop {
            let data: Vec<(u32, SocketAddr, Vec<u8>)> = alice_events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    IceEvent::Data { component_id, from, payload } => Some((*component_id, *from, payload.to_vec())),
                    _ => None,
                })
                .collect();
            if data.len() == 2 {
                return data;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("injected data not delivered");
    assert!(delivered.contains(&(2, rtcp.remote.addr, b"rtcp-payload".to_vec())));
    assert!(delivered.contains(&(1, rtp.remote.addr, b"rtp-payload".to_vec())));

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_candidates_trickled_after_start() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let alice = agent_on(&net, ALICE_IP, fast_config(IceRole::Controlling))?;
    let bob = agent_on(&net, BOB_IP, fast_config(IceRole::Controlled))?;
    alice.gather_candidates().await?;
    bob.gather_candidates().await?;

    // Both sides start with a peer address nobody listens on
    let nowhere = from_sdp("candidate:1 1 UDP 2130706431 192.168.1.9 50000 typ host")?;
    for (agent, peer) in [(&alice, &bob), (&bob, &alice)] {
        agent.add_remote_candidate(nowhere.clone())?;
        let credentials = peer.get_local_credentials();
        agent.set_remote_credentials(&credentials.ufrag, &credentials.pwd)?;
        agent.start_checks()?;
    }
    assert_eq!(alice.get_state(), IceState::Checking);
    assert_eq!(alice.get_check_list().len(), 1);

    for candidate in bob.get_local_candidates() {
        alice.add_remote_candidate(candidate)?;
    }
    for candidate in alice.get_local_candidates() {
        bob.add_remote_candidate(candidate)?;
    }
    assert_eq!(alice.get_check_list().len(), 2);

    assert!(wait_for_state(&alice, IceState::Completed, Duration::from_secs(5)).await);
    assert!(wait_for_state(&bob, IceState::Completed, Duration::from_secs(5)).await);

    let selected = alice.get_selected_pair().unwrap();
    assert_eq!(selected.remote.addr, "192.168.1.6:50000".parse::<SocketAddr>().unwrap());
    assert!(alice
        .get_check_list()
        .iter()
        .any(|p| p.remote.addr == nowhere.addr && p.state == CandidatePairState::Failed));

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_role_conflict_resolves() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let alice = agent_on(&net, ALICE_IP, fast_config(IceRole::Controlling))?;
    let bob = agent_on(&net, BOB_IP, fast_config(IceRole::Controlling))?;

    connect_pair(&alice, &bob).await?;
    assert!(wait_for_state(&alice, IceState::Completed, Duration::from_secs(5)).await);
    assert!(wait_for_state(&bob, IceState::Completed, Duration::from_secs(5)).await);

    assert_ne!(alice.get_role(), bob.get_role());
    info!("Roles after conflict: {:?} / {:?}", alice.get_role(), bob.get_role());

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_lost_checks_are_retransmitted() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();

    // The first three datagrams from Alice to Bob disappear
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = dropped.clone();
    net.set_filter(move |from, to| {
        if from.ip() == ip(ALICE_IP) && to.ip() == ip(BOB_IP) {
            return counter.fetch_add(1, Ordering::SeqCst) >= 3;
        }
        true
    });

    let alice = agent_on(&net, ALICE_IP, fast_config(IceRole::Controlling))?;
    let bob = agent_on(&net, BOB_IP, fast_config(IceRole::Controlled))?;
    connect_pair(&alice, &bob).await?;

    assert!(wait_for_state(&alice, IceState::Completed, Duration::from_secs(5)).await);
    assert!(wait_for_state(&bob, IceState::Completed, Duration::from_secs(5)).await);
    assert!(dropped.load(Ordering::SeqCst) > 3);

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_peer_fails() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let config = IceConfig {
        check_timeout_ms: 50,
        check_retries: 2,
        connectivity_check_timeout_ms: 400,
        ..Default::default()
    };
    let alice = agent_on(&net, ALICE_IP, config)?;
    let events = record_events(&alice);

    alice.gather_candidates().await?;
    let nobody = sharp_ice::Candidate::new_host("192.168.1.9:50000".parse().unwrap(), 1, 65535);
    alice.add_remote_candidate(nobody)?;
    alice.set_remote_credentials("peerufrag", "peerpassword0123456789abcd")?;
    alice.start_checks()?;

    assert!(wait_for_state(&alice, IceState::Failed, Duration::from_secs(3)).await);
    assert!(alice.get_selected_pair().is_none());
    assert!(alice.get_check_list().iter().all(|p| p.state.is_terminal()));
    assert!(matches!(alice.send(1, b"x").await, Err(NatError::InvalidState(_))));

    let events = events.lock();
    assert_eq!(selections(&events), 0);
    assert_eq!(state_changes(&events).last(), Some(&IceState::Failed));
    drop(events);

    alice.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_stops_notifications() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let alice = agent_on(&net, ALICE_IP, fast_config(IceRole::Controlling))?;
    let bob = agent_on(&net, BOB_IP, fast_config(IceRole::Controlled))?;
    let alice_events = record_events(&alice);

    connect_pair(&alice, &bob).await?;
    assert!(wait_for_state(&alice, IceState::Completed, Duration::from_secs(5)).await);

    alice.close().await?;
    let seen = alice_events.lock().len();
    assert_eq!(alice_events.lock().last(), Some(&IceEvent::StateChanged(IceState::Closed)));

    // Traffic for the closed agent goes nowhere
    bob.send(1, b"anyone there?").await?;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(alice_events.lock().len(), seen);

    assert!(matches!(alice.start_checks(), Err(NatError::InvalidState(_))));
    assert!(alice.close().await.is_ok());
    assert!(alice.get_selected_pair().is_none());

    bob.close().await?;
    Ok(())
}

/// STUN server on the memory network reporting a fixed mapped address
fn spawn_stun_server(net: &MemoryNetwork, addr: &str, mapped: SocketAddr) {
    let socket = net.bind(addr.parse().unwrap()).unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let Ok(request) = Message::decode(&buf[..len]) else { continue };
            let response = Message::response_to(&request, MessageClass::SuccessResponse)
                .unwrap()
                .with_attribute(Attribute::XorMappedAddress(mapped));
            let _ = socket.send_to(&response.encode(None, true).unwrap(), from).await;
        }
    });
}

#[tokio::test]
async fn test_server_reflexive_gathering() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let mapped: SocketAddr = "198.51.100.7:61000".parse().unwrap();
    spawn_stun_server(&net, "203.0.113.1:3478", mapped);

    let config = IceConfig {
        stun_servers: vec![StunServerConfig::new("203.0.113.1", 3478)],
        stun_timeout_ms: 200,
        stun_retries: 1,
        ..Default::default()
    };
    let alice = agent_on(&net, ALICE_IP, config)?;
    let events = record_events(&alice);
    alice.gather_candidates().await?;

    let candidates = alice.get_local_candidates();
    assert_eq!(candidates.len(), 2);
    let srflx = candidates.iter().find(|c| c.typ == CandidateType::ServerReflexive).unwrap();
    assert_eq!(srflx.addr, mapped);
    assert_eq!(srflx.related_addr, Some("192.168.1.5:50000".parse().unwrap()));
    assert_eq!(alice.get_state(), IceState::Gathering);

    let events = events.lock();
    let gathered = events.iter().filter(|e| matches!(e, IceEvent::CandidateGathered(_))).count();
    assert_eq!(gathered, 2);
    assert_eq!(events.last(), Some(&IceEvent::GatheringComplete));
    drop(events);

    alice.close().await?;
    Ok(())
}

const TURN_REALM: &str = "sharp-test";

struct FakeTurn {
    released: Arc<AtomicBool>,
}

/// Single-allocation TURN server relaying between its client and peers
fn spawn_turn_server(net: &MemoryNetwork, addr: &str, relay_ip: &str) -> FakeTurn {
    let control = net.bind(addr.parse().unwrap()).unwrap();
    let relay: Arc<MemorySocket> = net.bind(SocketAddr::new(ip(relay_ip), 0)).unwrap();
    let relayed = relay.local_addr().unwrap();
    let key = long_term_key("user", TURN_REALM, "secret");
    let client: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let channels: Arc<Mutex<Vec<(u16, SocketAddr)>>> = Arc::new(Mutex::new(Vec::new()));
    let released = Arc::new(AtomicBool::new(false));

    // Peer -> client
    {
        let (control, relay, client, channels) = (control.clone(), relay.clone(), client.clone(), channels.clone());
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, peer)) = relay.recv_from(&mut buf).await {
                let Some(client) = *client.lock() else { continue };
                let channel = channels.lock().iter().find(|(_, p)| *p == peer).map(|(c, _)| *c);
                let framed = match channel {
                    Some(channel) => encode_channel_data(channel, &buf[..len]).unwrap(),
                    None => Message::new(MessageType::DataIndication, TransactionId::new())
                        .with_attribute(Attribute::XorPeerAddress(peer))
                        .with_attribute(Attribute::Data(buf[..len].to_vec()))
                        .encode(None, false)
                        .unwrap(),
                };
                let _ = control.send_to(&framed, client).await;
            }
        });
    }

    // Client -> server / peers
    {
        let released = released.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = control.recv_from(&mut buf).await {
                let data = &buf[..len];

                if is_channel_data(data) {
                    let Ok((channel, payload)) = decode_channel_data(data) else { continue };
                    let peer = channels.lock().iter().find(|(c, _)| *c == channel).map(|(_, p)| *p);
                    if let Some(peer) = peer {
                        let _ = relay.send_to(payload, peer).await;
                    }
                    continue;
                }

                let Ok(request) = Message::decode(data) else { continue };
                let peer = request.attributes.iter().find_map(|a| match a {
                    Attribute::XorPeerAddress(p) => Some(*p),
                    _ => None,
                });

                if request.message_type == MessageType::SendIndication {
                    let payload = request.attributes.iter().find_map(|a| match a {
                        Attribute::Data(d) => Some(d.clone()),
                        _ => None,
                    });
                    if let (Some(peer), Some(payload)) = (peer, payload) {
                        let _ = relay.send_to(&payload, peer).await;
                    }
                    continue;
                }

                let authorized = request.has_attribute(AttributeType::MessageIntegrity)
                    && request.verify_integrity(&key, data).is_ok();
                let response = if !authorized {
                    Message::response_to(&request, MessageClass::ErrorResponse)
                        .unwrap()
                        .with_attribute(Attribute::ErrorCode { code: 401, reason: "Unauthorized".into() })
                        .with_attribute(Attribute::Realm(TURN_REALM.into()))
                        .with_attribute(Attribute::Nonce(b"nonce-1".to_vec()))
                } else {
                    let mut ok = Message::response_to(&request, MessageClass::SuccessResponse).unwrap();
                    match request.message_type {
                        MessageType::AllocateRequest => {
                            *client.lock() = Some(from);
                            ok.add_attribute(Attribute::XorRelayedAddress(relayed));
                            ok.add_attribute(Attribute::XorMappedAddress(from));
                            ok.add_attribute(Attribute::Lifetime(600));
                        }
                        MessageType::RefreshRequest => {
                            let lifetime = request.attributes.iter().find_map(|a| match a {
                                Attribute::Lifetime(l) => Some(*l),
                                _ => None,
                            });
                            if lifetime == Some(0) {
                                released.store(true, Ordering::SeqCst);
                            }
                            ok.add_attribute(Attribute::Lifetime(lifetime.unwrap_or(600)));
                        }
                        MessageType::ChannelBindRequest => {
                            let channel = request.attributes.iter().find_map(|a| match a {
                                Attribute::ChannelNumber(c) => Some(*c),
                                _ => None,
                            });
                            if let (Some(channel), Some(peer)) = (channel, peer) {
                                channels.lock().push((channel, peer));
                            }
                        }
                        _ => {}
                    }
                    ok
                };

                let encoded = response.encode(authorized.then_some(key.as_slice()), true).unwrap();
                let _ = control.send_to(&encoded, from).await;
            }
        });
    }

    FakeTurn { released }
}

fn turn_config(role: IceRole) -> IceConfig {
    IceConfig {
        gather_relay: true,
        turn_servers: vec![TurnServerConfig {
            server: "203.0.113.50".into(),
            username: "user".into(),
            password: "secret".into(),
            ..Default::default()
        }],
        stun_timeout_ms: 200,
        stun_retries: 1,
        ..fast_config(role)
    }
}

#[tokio::test]
async fn test_relay_gathering_and_release() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let turn = spawn_turn_server(&net, "203.0.113.50:3478", "198.51.100.10");

    let alice = agent_on(&net, ALICE_IP, turn_config(IceRole::Controlling))?;
    alice.gather_candidates().await?;

    let candidates = alice.get_local_candidates();
    let relay = candidates.iter().find(|c| c.typ == CandidateType::Relay).unwrap();
    assert_eq!(relay.addr, "198.51.100.10:50000".parse::<SocketAddr>().unwrap());
    assert_eq!(relay.related_addr, Some("192.168.1.5:50001".parse().unwrap()));
    assert!(candidates.iter().any(|c| c.typ == CandidateType::Host));

    alice.close().await?;
    assert!(turn.released.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_connects_through_relay_when_direct_path_is_blocked() -> NatResult<()> {
    setup_test_logging();
    let net = MemoryNetwork::new();
    let _turn = spawn_turn_server(&net, "203.0.113.50:3478", "198.51.100.10");

    // No direct traffic between the two LAN hosts
    net.set_filter(|from, to| {
        let lan = [ip(ALICE_IP), ip(BOB_IP)];
        !(lan.contains(&from.ip()) && lan.contains(&to.ip()))
    });

    let alice = agent_on(&net, ALICE_IP, turn_config(IceRole::Controlling))?;
    let bob = agent_on(&net, BOB_IP, fast_config(IceRole::Controlled))?;
    let bob_events = record_events(&bob);
    connect_pair(&alice, &bob).await?;

    assert!(wait_for_state(&alice, IceState::Completed, Duration::from_secs(5)).await);
    assert!(wait_for_state(&bob, IceState::Completed, Duration::from_secs(5)).await);

    let selected = alice.get_selected_pair().unwrap();
    assert_eq!(selected.local.typ, CandidateType::Relay);
    assert_eq!(selected.remote.addr, "192.168.1.6:50000".parse::<SocketAddr>().unwrap());
    assert_eq!(bob.get_selected_pair().unwrap().remote.addr, selected.local.addr);

    alice.send(1, b"relayed").await?;
    let delivered = timeout(Duration::from_secs(2), async {
        loop {
            let found = bob_events.lock().iter().any(|e| match e {
                IceEvent::Data { payload, from, .. } => &payload[..] == b"relayed" && *from == selected.local.addr,
                _ => false,
            });
            if found {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(delivered.is_ok());

    alice.close().await?;
    bob.close().await?;
    Ok(())
}
