//! Peer sessions: the adaptor between the wire and the chasers.
//!
//! Outbound sessions drive header synchronization and block download;
//! both directions serve locator queries, block requests, and forward
//! confirmed-block announcements.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bn_consensus::constants::{
    block_locator_size, MAX_GET_BLOCKS, MAX_GET_HEADERS, SENDHEADERS_VERSION,
};
use bn_consensus::Hash256;
use bn_primitives::block::Block;
use bn_storage::KeyValueStore;
use tokio::net::TcpListener;
use tokio::time::{interval, timeout, Duration};

use crate::node::{Announcement, NodeHandle};
use crate::p2p::{
    build_getdata_payload, build_headers_payload, build_inv_payload, build_locator_payload,
    build_notfound_payload, parse_headers, parse_inv, parse_locator_request, InventoryVector,
    Peer, PeerRegistry, MSG_BLOCK,
};

const READ_TIMEOUT_SECS: u64 = 120;
const TICK_MILLIS: u64 = 500;
const DOWNLOAD_BATCH: usize = 16;
const MAX_INBOUND_GETDATA: usize = 256;

struct PeerState {
    /// Peer asked for header announcements (BIP130 `sendheaders`).
    headers_to_peer: bool,
    /// We asked the peer for header announcements.
    sent_sendheaders: bool,
    /// Bound for overlapping locator responses.
    last_locator_top: Option<Hash256>,
    /// Block hashes we have requested from this peer.
    requested: HashSet<Hash256>,
    /// Progress marker for the header-latency timer.
    last_progress: tokio::time::Instant,
}

impl PeerState {
    fn new() -> Self {
        Self {
            headers_to_peer: false,
            sent_sendheaders: false,
            last_locator_top: None,
            requested: HashSet::new(),
            last_progress: tokio::time::Instant::now(),
        }
    }
}

/// Dial a configured peer and run the full protocol until error or stop.
pub async fn run_outbound<S: KeyValueStore + Send + Sync + 'static>(
    handle: NodeHandle<S>,
    addr: SocketAddr,
    magic: [u8; 4],
    registry: Arc<PeerRegistry>,
) -> Result<(), String> {
    let mut peer = Peer::connect(addr, magic, registry).await?;
    let start_height = handle.archive().get_top_confirmed().unwrap_or(0) as i32;
    let witness = handle.inner().config.network.witness_node;
    peer.handshake(start_height, witness).await?;
    bn_log::log_session!(
        "outbound peer {} version {} agent {}",
        peer.addr(),
        peer.remote_version(),
        peer.remote_user_agent()
    );

    // Seed header synchronization.
    let locator = handle.archive().get_locator().map_err(|err| err.to_string())?;
    peer.send_message("getheaders", &build_locator_payload(&locator, &[0u8; 32]))
        .await?;

    run_peer(handle, peer, true).await
}

/// Accept inbound connections and serve each on its own task.
pub async fn run_inbound<S: KeyValueStore + Send + Sync + 'static>(
    handle: NodeHandle<S>,
    listener: TcpListener,
    magic: [u8; 4],
    registry: Arc<PeerRegistry>,
) -> Result<(), String> {
    let max_connections = handle.inner().config.network.inbound_connections;
    let delay_inbound = handle.inner().config.node.delay_inbound;
    if let Ok(local) = listener.local_addr() {
        bn_log::log_info!("listening on {local}");
    }

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                bn_log::log_warn!("accept failed: {err}");
                continue;
            }
        };
        if handle.closed() {
            return Ok(());
        }
        if registry.count() >= max_connections {
            bn_log::log_session!("refusing inbound {remote_addr}: at capacity");
            drop(stream);
            continue;
        }
        if delay_inbound && !is_current(&handle) {
            bn_log::log_session!("refusing inbound {remote_addr}: not current");
            drop(stream);
            continue;
        }

        let handle = handle.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut peer = Peer::from_inbound(stream, remote_addr, magic, registry);
            let start_height = handle.archive().get_top_confirmed().unwrap_or(0) as i32;
            let witness = handle.inner().config.network.witness_node;
            if let Err(err) = peer.handshake(start_height, witness).await {
                bn_log::log_session!("inbound handshake {remote_addr}: {err}");
                return;
            }
            if let Err(err) = run_peer(handle, peer, false).await {
                bn_log::log_session!("inbound peer {remote_addr} closed: {err}");
            }
        });
    }
}

fn is_current<S: KeyValueStore + Send + Sync + 'static>(handle: &NodeHandle<S>) -> bool {
    let archive = handle.archive();
    match (archive.get_top_candidate(), archive.get_top_confirmed()) {
        (Ok(candidate), Ok(confirmed)) => candidate == confirmed,
        _ => false,
    }
}

async fn run_peer<S: KeyValueStore + Send + Sync + 'static>(
    handle: NodeHandle<S>,
    mut peer: Peer,
    sync_peer: bool,
) -> Result<(), String> {
    let mut state = PeerState::new();
    let mut announcements = handle.announcements();
    let mut stopping = handle.stopping();
    let mut ticker = interval(Duration::from_millis(TICK_MILLIS));
    let block_latency = Duration::from_secs(handle.inner().config.node.block_latency_seconds);
    let peer_id = peer.id();

    let result = loop {
        tokio::select! {
            message = timeout(Duration::from_secs(READ_TIMEOUT_SECS), peer.read_message()) => {
                let (command, payload) = match message {
                    Ok(Ok(message)) => message,
                    Ok(Err(err)) => break Err(err),
                    Err(_) => break Err("peer read timed out".to_string()),
                };
                if let Err(err) =
                    handle_message(&handle, &mut peer, &mut state, &command, &payload).await
                {
                    break Err(err);
                }
            }
            announcement = announcements.recv() => {
                match announcement {
                    Ok(announcement) => {
                        if let Err(err) =
                            announce(&handle, &mut peer, &state, announcement).await
                        {
                            break Err(err);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break Ok(()),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
            _ = ticker.tick() => {
                if handle.closed() {
                    break Ok(());
                }
                if handle.inner().take_disconnect(peer_id) {
                    break Err("peer penalized".to_string());
                }
                if sync_peer {
                    if let Err(err) =
                        tick_sync(&handle, &mut peer, &mut state, block_latency).await
                    {
                        break Err(err);
                    }
                }
            }
            _ = stopping.changed() => {
                break Ok(());
            }
        }
    };

    handle.release_downloads(peer_id);
    result
}

/// Periodic work for synchronizing peers: block download and staleness.
async fn tick_sync<S: KeyValueStore + Send + Sync + 'static>(
    handle: &NodeHandle<S>,
    peer: &mut Peer,
    state: &mut PeerState,
    block_latency: tokio::time::Duration,
) -> Result<(), String> {
    // Stale: the peer claims more chain but is not delivering.
    let top = handle.archive().get_top_candidate().unwrap_or(0);
    let behind = peer.remote_height() > top as i32;
    if behind && state.last_progress.elapsed() > block_latency {
        return Err("peer exceeded configured block latency".to_string());
    }

    if state.requested.len() >= DOWNLOAD_BATCH {
        return Ok(());
    }
    let batch = handle
        .download_batch(peer.id(), DOWNLOAD_BATCH - state.requested.len())
        .await
        .unwrap_or_default();
    if batch.is_empty() {
        return Ok(());
    }
    state.requested.extend(batch.iter().copied());
    peer.send_message("getdata", &build_getdata_payload(&batch, MSG_BLOCK))
        .await
}

async fn handle_message<S: KeyValueStore + Send + Sync + 'static>(
    handle: &NodeHandle<S>,
    peer: &mut Peer,
    state: &mut PeerState,
    command: &str,
    payload: &[u8],
) -> Result<(), String> {
    match command {
        "headers" => {
            let headers = parse_headers(payload)?;
            state.last_progress = tokio::time::Instant::now();
            let count = headers.len();
            let last_hash = headers.last().map(|header| header.hash());
            if count > 0 {
                handle.organize_headers(headers, peer.id());
            }
            if count == MAX_GET_HEADERS {
                // Peer has more; anchor the next request at the run's tail
                // since organization is asynchronous.
                if let Some(anchor) = last_hash {
                    peer.send_message(
                        "getheaders",
                        &build_locator_payload(&[anchor], &[0u8; 32]),
                    )
                    .await?;
                }
            } else if !state.sent_sendheaders
                && peer.remote_version() >= SENDHEADERS_VERSION
            {
                // Caught up: switch this peer to header announcements.
                state.sent_sendheaders = true;
                peer.send_message("sendheaders", &[]).await?;
            }
            Ok(())
        }
        "sendheaders" => {
            state.headers_to_peer = true;
            Ok(())
        }
        "inv" => {
            let mut unknown = Vec::new();
            for entry in parse_inv(payload)? {
                if entry.inv_type != MSG_BLOCK {
                    continue;
                }
                let known = handle
                    .archive()
                    .to_link(&entry.hash)
                    .map_err(|err| err.to_string())?
                    .is_some();
                if !known && state.requested.insert(entry.hash) {
                    unknown.push(entry.hash);
                }
            }
            if !unknown.is_empty() {
                // An inv of an unknown block implies unknown headers too.
                let locator = handle
                    .archive()
                    .get_locator()
                    .map_err(|err| err.to_string())?;
                peer.send_message(
                    "getheaders",
                    &build_locator_payload(&locator, &[0u8; 32]),
                )
                .await?;
                peer.send_message("getdata", &build_getdata_payload(&unknown, MSG_BLOCK))
                    .await?;
            }
            Ok(())
        }
        "block" => {
            let block = Block::consensus_decode(payload).map_err(|err| err.to_string())?;
            state.requested.remove(&block.hash());
            state.last_progress = tokio::time::Instant::now();
            handle.submit_block(block, peer.id());
            Ok(())
        }
        "getheaders" => {
            let request = parse_locator_request(payload)?;
            check_locator_size(handle, request.locator.len())?;
            let headers = handle
                .archive()
                .get_locator_headers(&locator_above(state, &request.locator), &request.stop, MAX_GET_HEADERS)
                .map_err(|err| err.to_string())?;
            if let Some(first) = headers.first() {
                state.last_locator_top = Some(first.hash());
            }
            peer.send_message("headers", &build_headers_payload(&headers))
                .await
        }
        "getblocks" => {
            let request = parse_locator_request(payload)?;
            check_locator_size(handle, request.locator.len())?;
            let hashes = handle
                .archive()
                .get_locator_hashes(&locator_above(state, &request.locator), &request.stop, MAX_GET_BLOCKS)
                .map_err(|err| err.to_string())?;
            if let Some(first) = hashes.first() {
                state.last_locator_top = Some(*first);
            }
            if hashes.is_empty() {
                return Ok(());
            }
            peer.send_message("inv", &build_inv_payload(&hashes, MSG_BLOCK))
                .await
        }
        "getdata" => {
            let entries = parse_inv(payload)?;
            if entries.len() > MAX_INBOUND_GETDATA {
                return Err("oversized getdata".to_string());
            }
            let mut not_found = Vec::new();
            for entry in entries {
                if entry.inv_type != MSG_BLOCK {
                    continue;
                }
                match lookup_block(handle, &entry.hash)? {
                    Some(bytes) => peer.send_message("block", &bytes).await?,
                    None => not_found.push(InventoryVector {
                        inv_type: MSG_BLOCK,
                        hash: entry.hash,
                    }),
                }
            }
            if !not_found.is_empty() {
                peer.send_message("notfound", &build_notfound_payload(&not_found))
                    .await?;
            }
            Ok(())
        }
        "ping" => peer.send_message("pong", payload).await,
        "pong" | "notfound" | "addr" | "tx" | "feefilter" => Ok(()),
        _ => {
            bn_log::log_protocol!("ignoring {command} from {}", peer.addr());
            Ok(())
        }
    }
}

/// Memoized locator floor: never serve below the last response's top.
fn locator_above(state: &PeerState, locator: &[Hash256]) -> Vec<Hash256> {
    match state.last_locator_top {
        Some(top) if !locator.contains(&top) => {
            let mut bounded = Vec::with_capacity(locator.len() + 1);
            bounded.push(top);
            bounded.extend_from_slice(locator);
            bounded
        }
        _ => locator.to_vec(),
    }
}

fn check_locator_size<S: KeyValueStore + Send + Sync + 'static>(
    handle: &NodeHandle<S>,
    size: usize,
) -> Result<(), String> {
    let top = handle.archive().get_top_confirmed().unwrap_or(0);
    if size > block_locator_size(top) + 1 {
        return Err("excessive locator size".to_string());
    }
    Ok(())
}

fn lookup_block<S: KeyValueStore + Send + Sync + 'static>(
    handle: &NodeHandle<S>,
    hash: &Hash256,
) -> Result<Option<Vec<u8>>, String> {
    let archive = handle.archive();
    let Some(link) = archive.to_link(hash).map_err(|err| err.to_string())? else {
        return Ok(None);
    };
    match archive.is_associated(link).map_err(|err| err.to_string())? {
        true => {
            let block = archive.get_block(link).map_err(|err| err.to_string())?;
            Ok(Some(block.consensus_encode()))
        }
        false => Ok(None),
    }
}

/// Forward a confirmed-block announcement, skipping its originator.
async fn announce<S: KeyValueStore + Send + Sync + 'static>(
    handle: &NodeHandle<S>,
    peer: &mut Peer,
    state: &PeerState,
    announcement: Announcement,
) -> Result<(), String> {
    if announcement.originator == Some(peer.id()) {
        return Ok(());
    }
    if state.headers_to_peer {
        let Some(link) = handle
            .archive()
            .to_link(&announcement.hash)
            .map_err(|err| err.to_string())?
        else {
            return Ok(());
        };
        let header = handle
            .archive()
            .get_block_header(link)
            .map_err(|err| err.to_string())?;
        peer.send_message("headers", &build_headers_payload(&[header]))
            .await
    } else {
        peer.send_message("inv", &build_inv_payload(&[announcement.hash], MSG_BLOCK))
            .await
    }
}
