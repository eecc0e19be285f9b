//! Node composition: archive handle, event bus, chasers, stop latch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::JoinHandle;

use bn_archive::{Archive, HeaderLink};
use bn_consensus::Hash256;
use bn_primitives::block::{Block, BlockHeader};
use bn_storage::KeyValueStore;
use tokio::sync::{broadcast, oneshot, watch};

use crate::chaser_check::{self, CheckCommand};
use crate::chaser_confirm;
use crate::chaser_header::{self, HeaderCommand};
use crate::chaser_validate;
use crate::config::Config;
use crate::events::{Chase, ChaseEvent, EventBus, FaultCode};

/// A newly confirmed block to announce to peers.
#[derive(Clone, Debug)]
pub struct Announcement {
    pub hash: Hash256,
    pub height: u32,
    pub originator: Option<u64>,
}

/// State shared by the chasers and sessions. Chasers hold clones of the
/// `Arc`; nothing points back at them.
pub struct NodeInner<S> {
    pub archive: Arc<Archive<S>>,
    pub bus: EventBus,
    pub config: Config,
    closed: AtomicBool,
    suspended: AtomicBool,
    stop_once: Once,
    fault: Mutex<Option<FaultCode>>,
    stopping_tx: watch::Sender<bool>,
    originators: Mutex<HashMap<HeaderLink, u64>>,
    disconnects: Mutex<HashSet<u64>>,
}

impl<S> NodeInner<S> {
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Idempotent stop. The first caller wins; later faults are dropped.
    pub fn stop(&self, ec: Option<FaultCode>) {
        self.stop_once.call_once(|| {
            self.closed.store(true, Ordering::Release);
            if let Some(code) = ec {
                if !code.is_shutdown() {
                    *self.fault.lock().expect("fault lock") = Some(code);
                    bn_log::log_error!("node fault: {code}");
                }
            }
            self.bus.publish(ChaseEvent::stop(ec));
            let _ = self.stopping_tx.send(true);
        });
    }

    /// Escalate a non-recoverable error.
    pub fn fault(&self, code: FaultCode) {
        self.stop(Some(code));
    }

    pub fn fault_code(&self) -> Option<FaultCode> {
        *self.fault.lock().expect("fault lock")
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        self.bus.publish(ChaseEvent::new(Chase::Suspend, 0));
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        self.bus.publish(ChaseEvent::new(Chase::Resume, 0));
    }

    pub fn stopping(&self) -> watch::Receiver<bool> {
        self.stopping_tx.subscribe()
    }

    pub fn set_originator(&self, link: HeaderLink, peer: u64) {
        self.originators
            .lock()
            .expect("originator lock")
            .insert(link, peer);
    }

    pub fn originator(&self, link: HeaderLink) -> Option<u64> {
        self.originators
            .lock()
            .expect("originator lock")
            .get(&link)
            .copied()
    }

    /// Flag a peer for disconnection; its session polls the flag.
    pub fn request_disconnect(&self, peer: u64) {
        self.disconnects.lock().expect("disconnect lock").insert(peer);
    }

    pub fn take_disconnect(&self, peer: u64) -> bool {
        self.disconnects.lock().expect("disconnect lock").remove(&peer)
    }
}

pub struct FullNode<S> {
    inner: Arc<NodeInner<S>>,
    header_tx: Option<crossbeam_channel::Sender<HeaderCommand>>,
    check_tx: Option<crossbeam_channel::Sender<CheckCommand>>,
    announce_tx: broadcast::Sender<Announcement>,
    handles: Vec<JoinHandle<()>>,
}

/// Cloneable facade handed to peer sessions.
pub struct NodeHandle<S> {
    inner: Arc<NodeInner<S>>,
    header_tx: crossbeam_channel::Sender<HeaderCommand>,
    check_tx: crossbeam_channel::Sender<CheckCommand>,
    announce_tx: broadcast::Sender<Announcement>,
}

impl<S> Clone for NodeHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            header_tx: self.header_tx.clone(),
            check_tx: self.check_tx.clone(),
            announce_tx: self.announce_tx.clone(),
        }
    }
}

impl<S: KeyValueStore + Send + Sync + 'static> NodeHandle<S> {
    pub fn inner(&self) -> &NodeInner<S> {
        &self.inner
    }

    pub fn archive(&self) -> &Arc<Archive<S>> {
        &self.inner.archive
    }

    pub fn closed(&self) -> bool {
        self.inner.closed()
    }

    pub fn organize_headers(&self, headers: Vec<BlockHeader>, peer: u64) {
        let _ = self.header_tx.send(HeaderCommand::Organize { headers, peer });
    }

    pub fn submit_block(&self, block: Block, peer: u64) {
        let _ = self.check_tx.send(CheckCommand::Submit { block, peer });
    }

    pub fn download_batch(&self, peer: u64, count: usize) -> oneshot::Receiver<Vec<Hash256>> {
        let (reply, receiver) = oneshot::channel();
        let _ = self.check_tx.send(CheckCommand::Batch { peer, count, reply });
        receiver
    }

    pub fn release_downloads(&self, peer: u64) {
        let _ = self.check_tx.send(CheckCommand::Release { peer });
    }

    pub fn announcements(&self) -> broadcast::Receiver<Announcement> {
        self.announce_tx.subscribe()
    }

    pub fn stopping(&self) -> watch::Receiver<bool> {
        self.inner.stopping()
    }
}

impl<S: KeyValueStore + Send + Sync + 'static> FullNode<S> {
    pub fn new(archive: Arc<Archive<S>>, config: Config) -> Self {
        let (stopping_tx, _) = watch::channel(false);
        let (announce_tx, _) = broadcast::channel(256);
        let inner = Arc::new(NodeInner {
            archive,
            bus: EventBus::new(),
            config,
            closed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            stop_once: Once::new(),
            fault: Mutex::new(None),
            stopping_tx,
            originators: Mutex::new(HashMap::new()),
            disconnects: Mutex::new(HashSet::new()),
        });
        Self {
            inner,
            header_tx: None,
            check_tx: None,
            announce_tx,
            handles: Vec::new(),
        }
    }

    pub fn inner(&self) -> Arc<NodeInner<S>> {
        Arc::clone(&self.inner)
    }

    pub fn archive(&self) -> Arc<Archive<S>> {
        Arc::clone(&self.inner.archive)
    }

    /// Spawn the chaser strands and seed the pipeline.
    pub fn start(&mut self) -> Result<(), String> {
        if self.inner.closed() {
            return Err("node already stopped".to_string());
        }

        let (confirm_handle,) = chaser_confirm::spawn(self.inner())?;
        let (validate_handle,) = chaser_validate::spawn(self.inner())?;
        let (check_tx, check_handle) = chaser_check::spawn(self.inner())?;
        let (header_tx, header_handle) = chaser_header::spawn(self.inner())?;
        self.handles
            .extend([confirm_handle, validate_handle, check_handle, header_handle]);
        self.check_tx = Some(check_tx);
        self.header_tx = Some(header_tx);

        self.spawn_announcer();

        self.inner.bus.publish(ChaseEvent::new(Chase::Start, 0));
        bn_log::log_info!(
            "node started at candidate {} confirmed {}",
            self.inner.archive.get_top_candidate().unwrap_or(0),
            self.inner.archive.get_top_confirmed().unwrap_or(0),
        );
        Ok(())
    }

    /// Bridge confirm-chaser organizes onto the async announcement channel.
    fn spawn_announcer(&mut self) {
        let inner = self.inner();
        let announce_tx = self.announce_tx.clone();
        let (_, receiver) = inner.bus.subscribe();
        let handle = std::thread::Builder::new()
            .name("announcer".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event.chase {
                        Chase::Stop => break,
                        Chase::Organized => {
                            let link = HeaderLink(event.value as u32);
                            let Ok(entry) = inner.archive.get_header(link) else {
                                continue;
                            };
                            // Candidate organizes carry links that are not
                            // yet confirmed; only confirmed pushes announce.
                            match inner.archive.to_confirmed(entry.height) {
                                Ok(Some(confirmed)) if confirmed == link => {}
                                _ => continue,
                            }
                            let _ = announce_tx.send(Announcement {
                                hash: entry.hash,
                                height: entry.height,
                                originator: inner.originator(link),
                            });
                        }
                        _ => {}
                    }
                }
            })
            .expect("spawn announcer");
        self.handles.push(handle);
    }

    /// Hand a run of peer headers to the header chaser.
    pub fn organize_headers(&self, headers: Vec<BlockHeader>, peer: u64) {
        if let Some(sender) = &self.header_tx {
            let _ = sender.send(HeaderCommand::Organize { headers, peer });
        }
    }

    /// Hand a peer-delivered block body to the check chaser.
    pub fn submit_block(&self, block: Block, peer: u64) {
        if let Some(sender) = &self.check_tx {
            let _ = sender.send(CheckCommand::Submit { block, peer });
        }
    }

    /// Ask the check chaser for block hashes to download.
    pub fn download_batch(&self, peer: u64, count: usize) -> oneshot::Receiver<Vec<Hash256>> {
        let (reply, receiver) = oneshot::channel();
        if let Some(sender) = &self.check_tx {
            let _ = sender.send(CheckCommand::Batch { peer, count, reply });
        }
        receiver
    }

    pub fn announcements(&self) -> broadcast::Receiver<Announcement> {
        self.announce_tx.subscribe()
    }

    /// Session facade; available once started.
    pub fn handle(&self) -> Option<NodeHandle<S>> {
        Some(NodeHandle {
            inner: self.inner(),
            header_tx: self.header_tx.clone()?,
            check_tx: self.check_tx.clone()?,
            announce_tx: self.announce_tx.clone(),
        })
    }

    /// Idempotent work-stop signal.
    pub fn stop(&self) {
        self.inner.stop(Some(FaultCode::ServiceStopped));
    }

    /// Blocking join of all strands. Call from the constructing thread.
    pub fn close(&mut self) -> Option<FaultCode> {
        self.stop();
        self.header_tx = None;
        self.check_tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        bn_log::log_info!("node closed");
        self.inner.fault_code()
    }
}

impl<S> Drop for FullNode<S> {
    fn drop(&mut self) {
        self.inner.stop(Some(FaultCode::ServiceStopped));
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
