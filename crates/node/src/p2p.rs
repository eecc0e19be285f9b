//! Bitcoin P2P transport: message framing, handshake, payload codecs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bn_consensus::constants::{MAX_GET_HEADERS, PROTOCOL_VERSION};
use bn_consensus::Hash256;
use bn_primitives::block::BlockHeader;
use bn_primitives::encoding::{Decoder, Encoder};
use bn_primitives::hash::sha256d;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const MAX_LOCATOR_HASHES: usize = 101;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
const NODE_NETWORK: u64 = 1;
const NODE_WITNESS: u64 = 1 << 3;
const SEND_TIMEOUT_SECS: u64 = 10;
const HANDSHAKE_READ_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("/bn:", env!("CARGO_PKG_VERSION"), "/");

/// Process-wide peer identities and connection counts.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    next_id: AtomicU64,
    connections: AtomicUsize,
    nonce: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        registry.nonce.store(rand::random(), Ordering::Relaxed);
        registry
    }

    pub fn register(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn unregister(&self) {
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_sub(1))
            })
            .ok();
    }

    pub fn count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Our version nonce, for self-connection detection.
    pub fn nonce(&self) -> u64 {
        self.nonce.load(Ordering::Relaxed)
    }
}

pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    id: u64,
    addr: SocketAddr,
    remote_height: i32,
    remote_version: i32,
    remote_services: u64,
    remote_user_agent: String,
    registry: Arc<PeerRegistry>,
}

impl Peer {
    pub async fn connect(
        addr: SocketAddr,
        magic: [u8; 4],
        registry: Arc<PeerRegistry>,
    ) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| err.to_string())?;
        let id = registry.register();
        Ok(Self {
            stream,
            magic,
            id,
            addr,
            remote_height: -1,
            remote_version: 0,
            remote_services: 0,
            remote_user_agent: String::new(),
            registry,
        })
    }

    pub fn from_inbound(
        stream: TcpStream,
        addr: SocketAddr,
        magic: [u8; 4],
        registry: Arc<PeerRegistry>,
    ) -> Self {
        let id = registry.register();
        Self {
            stream,
            magic,
            id,
            addr,
            remote_height: -1,
            remote_version: 0,
            remote_services: 0,
            remote_user_agent: String::new(),
            registry,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height
    }

    pub fn remote_version(&self) -> i32 {
        self.remote_version
    }

    pub fn remote_user_agent(&self) -> &str {
        &self.remote_user_agent
    }

    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), String> {
        let mut frame = Vec::with_capacity(24 + payload.len());
        frame.extend_from_slice(&self.magic);
        let mut command_bytes = [0u8; 12];
        let cmd = command.as_bytes();
        if cmd.len() > 12 {
            return Err("command too long".to_string());
        }
        command_bytes[..cmd.len()].copy_from_slice(cmd);
        frame.extend_from_slice(&command_bytes);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d(payload);
        frame.extend_from_slice(&checksum[..4]);
        frame.extend_from_slice(payload);
        timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            self.stream.write_all(&frame),
        )
        .await
        .map_err(|_| "peer write timed out".to_string())?
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), String> {
        let mut header = [0u8; 24];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| err.to_string())?;
        if header[..4] != self.magic {
            return Err("invalid magic".to_string());
        }
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err("payload too large".to_string());
        }
        let checksum = &header[20..24];
        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        let calc = sha256d(&payload);
        if checksum != &calc[..4] {
            return Err("invalid payload checksum".to_string());
        }
        Ok((command, payload))
    }

    pub async fn handshake(&mut self, start_height: i32, witness: bool) -> Result<(), String> {
        let payload = build_version_payload(start_height, witness, self.registry.nonce());
        self.send_message("version", &payload).await?;

        let mut got_verack = false;
        let mut got_version = false;
        while !(got_verack && got_version) {
            let (command, payload) = timeout(
                Duration::from_secs(HANDSHAKE_READ_TIMEOUT_SECS),
                self.read_message(),
            )
            .await
            .map_err(|_| "peer handshake timed out".to_string())??;
            match command.as_str() {
                "version" => {
                    got_version = true;
                    let info = parse_version(&payload)?;
                    if info.nonce == self.registry.nonce() {
                        return Err("connected to self".to_string());
                    }
                    self.remote_height = info.start_height;
                    self.remote_version = info.version;
                    self.remote_services = info.services;
                    self.remote_user_agent = info.user_agent;
                    self.send_message("verack", &[]).await?;
                }
                "verack" => {
                    got_verack = true;
                }
                "ping" => {
                    self.send_message("pong", &payload).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.registry.unregister();
    }
}

// Payload codecs.
// ---------------------------------------------------------------------------

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "header count too large".to_string())?;
    if count > MAX_GET_HEADERS {
        return Err("header count too large".to_string());
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header =
            BlockHeader::consensus_decode_from(&mut decoder).map_err(|err| err.to_string())?;
        let _tx_count = decoder.read_varint().map_err(|err| err.to_string())?;
        headers.push(header);
    }
    Ok(headers)
}

pub fn build_headers_payload(headers: &[BlockHeader]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        encoder.write_bytes(&header.consensus_encode());
        encoder.write_varint(0);
    }
    encoder.into_inner()
}

#[derive(Clone, Debug)]
pub struct LocatorRequest {
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

/// Shared by `getheaders` and `getblocks`.
pub fn parse_locator_request(payload: &[u8]) -> Result<LocatorRequest, String> {
    let mut decoder = Decoder::new(payload);
    let _protocol_version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "locator count too large".to_string())?;
    if count > MAX_LOCATOR_HASHES {
        return Err("locator count too large".to_string());
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        let hash = decoder.read_hash_le().map_err(|err| err.to_string())?;
        locator.push(hash);
    }
    let stop = decoder.read_hash_le().map_err(|err| err.to_string())?;
    if !decoder.is_empty() {
        return Err("trailing bytes in locator payload".to_string());
    }
    Ok(LocatorRequest { locator, stop })
}

pub fn build_locator_payload(locator: &[Hash256], stop: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(stop);
    encoder.into_inner()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash256,
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InventoryVector>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "inv count too large".to_string())?;
    if count > 50_000 {
        return Err("inv count too large".to_string());
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let hash = decoder.read_hash_le().map_err(|err| err.to_string())?;
        out.push(InventoryVector { inv_type, hash });
    }
    if !decoder.is_empty() {
        return Err("trailing bytes in inv payload".to_string());
    }
    Ok(out)
}

pub fn build_inv_payload(hashes: &[Hash256], inv_type: u32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(hashes.len() as u64);
    for hash in hashes {
        encoder.write_u32_le(inv_type);
        encoder.write_hash_le(hash);
    }
    encoder.into_inner()
}

pub fn build_getdata_payload(hashes: &[Hash256], inv_type: u32) -> Vec<u8> {
    build_inv_payload(hashes, inv_type)
}

pub fn build_notfound_payload(entries: &[InventoryVector]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(entries.len() as u64);
    for entry in entries {
        encoder.write_u32_le(entry.inv_type);
        encoder.write_hash_le(&entry.hash);
    }
    encoder.into_inner()
}

fn build_version_payload(start_height: i32, witness: bool, nonce: u64) -> Vec<u8> {
    let mut services = NODE_NETWORK;
    if witness {
        services |= NODE_WITNESS;
    }
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(services);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, services, [0u8; 16], 0);
    write_net_addr(&mut encoder, services, [0u8; 16], 0);
    encoder.write_u64_le(nonce);
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.write_u8(1);
    encoder.into_inner()
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

struct VersionInfo {
    version: i32,
    services: u64,
    nonce: u64,
    user_agent: String,
    start_height: i32,
}

fn parse_version(payload: &[u8]) -> Result<VersionInfo, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _timestamp = decoder.read_i64_le().map_err(|err| err.to_string())?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let nonce = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let user_agent = decoder.read_var_str().map_err(|err| err.to_string())?;
    let start_height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    Ok(VersionInfo {
        version,
        services,
        nonce,
        user_agent,
        start_height,
    })
}

fn read_net_addr(decoder: &mut Decoder) -> Result<(), String> {
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _ip = decoder.read_fixed::<16>().map_err(|err| err.to_string())?;
    let _port = decoder.read_bytes(2).map_err(|err| err.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tag: u8) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [tag; 32],
            merkle_root: [tag.wrapping_add(1); 32],
            time: 1_300_000_000,
            bits: 0x1d00_ffff,
            nonce: u32::from(tag),
        }
    }

    #[test]
    fn headers_round_trip() {
        let headers = vec![header(1), header(2), header(3)];
        let payload = build_headers_payload(&headers);
        assert_eq!(parse_headers(&payload).expect("parse"), headers);
    }

    #[test]
    fn headers_cap_enforced() {
        let mut encoder = Encoder::new();
        encoder.write_varint(MAX_GET_HEADERS as u64 + 1);
        assert!(parse_headers(&encoder.into_inner()).is_err());
    }

    #[test]
    fn locator_round_trip() {
        let locator = vec![[1u8; 32], [2u8; 32]];
        let stop = [9u8; 32];
        let payload = build_locator_payload(&locator, &stop);
        let request = parse_locator_request(&payload).expect("parse");
        assert_eq!(request.locator, locator);
        assert_eq!(request.stop, stop);
    }

    #[test]
    fn oversized_locator_rejected() {
        let locator = vec![[0u8; 32]; MAX_LOCATOR_HASHES + 1];
        let payload = build_locator_payload(&locator, &[0u8; 32]);
        assert!(parse_locator_request(&payload).is_err());
    }

    #[test]
    fn inv_round_trip() {
        let hashes = vec![[4u8; 32], [5u8; 32]];
        let payload = build_inv_payload(&hashes, MSG_BLOCK);
        let entries = parse_inv(&payload).expect("parse");
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|entry| entry.inv_type == MSG_BLOCK));
        assert_eq!(entries[0].hash, hashes[0]);
    }
}
