//! Validate chaser: context validation on an independent worker pool.
//!
//! The strand walks the candidate chain from its position, dispatching one
//! task per height until the backlog ceiling is reached or the next block
//! is unassociated. Tasks run concurrently across blocks; each touches only
//! its own link. The final in-flight completion posts a self-bump so the
//! walk resumes without leaning on external events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bn_archive::validation::{accept_block, connect_block};
use bn_archive::{ArchiveError, BlockState, HeaderLink};
use bn_consensus::deployments::Deployment;
use bn_storage::KeyValueStore;
use bn_script::{SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_WITNESS};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::events::{Chase, ChaseEvent, FaultCode};
use crate::node::NodeInner;

struct ValidateTask {
    link: HeaderLink,
    height: u32,
    bypass: bool,
}

struct Shared<S> {
    node: Arc<NodeInner<S>>,
    backlog: AtomicUsize,
    own: Sender<ChaseEvent>,
}

pub fn spawn<S: KeyValueStore + Send + Sync + 'static>(
    node: Arc<NodeInner<S>>,
) -> Result<(JoinHandle<()>,), String> {
    let (own_tx, events_rx) = node.bus.subscribe();
    let threads = node.config.node.threads.max(1);
    let maximum_backlog = node.config.node.maximum_concurrency.max(1);

    let shared = Arc::new(Shared {
        node,
        backlog: AtomicUsize::new(0),
        own: own_tx,
    });

    let (task_tx, task_rx) = unbounded::<ValidateTask>();
    let mut workers = Vec::with_capacity(threads);
    for index in 0..threads {
        let shared = Arc::clone(&shared);
        let task_rx: Receiver<ValidateTask> = task_rx.clone();
        let worker = std::thread::Builder::new()
            .name(format!("validate-{index}"))
            .spawn(move || {
                while let Ok(task) = task_rx.recv() {
                    validate_block(&shared, task);
                }
            })
            .map_err(|err| err.to_string())?;
        workers.push(worker);
    }
    drop(task_rx);

    let handle = std::thread::Builder::new()
        .name("chaser-validate".to_string())
        .spawn(move || {
            let mut position = match shared.node.archive.get_fork() {
                Ok(height) => height,
                Err(_) => {
                    shared.node.fault(FaultCode::Archive);
                    0
                }
            };
            let task_tx = task_tx;
            while let Ok(event) = events_rx.recv() {
                match event.chase {
                    Chase::Stop => break,
                    _ if shared.node.suspended() => continue,
                    Chase::Start | Chase::Resume | Chase::Bump => {
                        do_bump(&shared, &task_tx, &mut position, maximum_backlog);
                    }
                    Chase::Checked => {
                        let height = event.value as u32;
                        if u64::from(height) == u64::from(position) + 1 {
                            do_bumped(&shared, &task_tx, &mut position, height, maximum_backlog);
                        }
                    }
                    Chase::Regressed | Chase::Disorganized => {
                        let branch_point = event.value as u32;
                        if branch_point < position {
                            position = branch_point;
                        }
                    }
                    Chase::Unvalid => {
                        // Fall back below the failed block so the walk
                        // re-encounters its unconfirmable state and stops
                        // instead of validating stranded descendants.
                        let link = HeaderLink(event.value as u32);
                        if let Ok(entry) = shared.node.archive.get_header(link) {
                            if entry.height <= position {
                                position = entry.height.saturating_sub(1);
                            }
                        }
                    }
                    _ => {}
                }
            }
            // Closing the channel lets in-flight work finish, then joins.
            drop(task_tx);
            for worker in workers {
                let _ = worker.join();
            }
        })
        .map_err(|err| err.to_string())?;
    Ok((handle,))
}

/// Bumping may start anywhere, so the next position must already be in a
/// validatable state.
fn do_bump<S: KeyValueStore>(
    shared: &Arc<Shared<S>>,
    task_tx: &Sender<ValidateTask>,
    position: &mut u32,
    maximum_backlog: usize,
) {
    let height = *position + 1;
    let archive = &shared.node.archive;
    let link = match archive.to_candidate(height) {
        Ok(Some(link)) => link,
        Ok(None) => return,
        Err(_) => {
            shared.node.fault(FaultCode::Archive);
            return;
        }
    };
    let ready = match archive.get_block_state(link) {
        Ok(BlockState::Unvalidated)
        | Ok(BlockState::BlockValid { .. })
        | Ok(BlockState::BlockConfirmable) => true,
        Ok(_) => false,
        Err(_) => {
            shared.node.fault(FaultCode::Archive);
            return;
        }
    };
    if ready {
        do_bumped(shared, task_tx, position, height, maximum_backlog);
    }
}

fn do_bumped<S: KeyValueStore>(
    shared: &Arc<Shared<S>>,
    task_tx: &Sender<ValidateTask>,
    position: &mut u32,
    start: u32,
    maximum_backlog: usize,
) {
    let archive = &shared.node.archive;
    let mut height = start;
    while shared.backlog.load(Ordering::Relaxed) < maximum_backlog
        && !shared.node.closed()
        && !shared.node.suspended()
    {
        let link = match archive.to_candidate(height) {
            Ok(Some(link)) => link,
            Ok(None) => return,
            Err(_) => {
                shared.node.fault(FaultCode::Archive);
                return;
            }
        };
        let state = match archive.get_block_state(link) {
            Ok(state) => state,
            Err(_) => {
                shared.node.fault(FaultCode::Archive);
                return;
            }
        };

        // Unassociated stops the walk so bypass cannot mark missing bodies.
        if matches!(state, BlockState::Unassociated) {
            return;
        }

        let bypass = shared.node.archive.is_under_checkpoint(height)
            || match archive.is_milestone(link) {
                Ok(milestone) => milestone,
                Err(_) => {
                    shared.node.fault(FaultCode::Archive);
                    return;
                }
            };

        if bypass {
            if archive.filter_enabled() {
                post_block(shared, task_tx, link, height, true);
            } else {
                complete_valid(shared, height);
            }
        } else {
            match state {
                BlockState::Unvalidated => post_block(shared, task_tx, link, height, false),
                BlockState::BlockValid { .. } => {
                    match archive.is_prevouts_cached(link) {
                        Ok(true) => post_block(shared, task_tx, link, height, true),
                        Ok(false) => complete_valid(shared, height),
                        Err(_) => {
                            shared.node.fault(FaultCode::Archive);
                            return;
                        }
                    }
                }
                BlockState::BlockConfirmable => complete_valid(shared, height),
                BlockState::BlockUnconfirmable => return,
                BlockState::Unassociated => unreachable!("handled above"),
            }
        }

        *position = height;
        height += 1;
    }
}

fn post_block<S>(
    shared: &Arc<Shared<S>>,
    task_tx: &Sender<ValidateTask>,
    link: HeaderLink,
    height: u32,
    bypass: bool,
) {
    shared.backlog.fetch_add(1, Ordering::Relaxed);
    let _ = task_tx.send(ValidateTask {
        link,
        height,
        bypass,
    });
}

fn complete_valid<S>(shared: &Arc<Shared<S>>, height: u32) {
    shared
        .node
        .bus
        .publish(ChaseEvent::new(Chase::Valid, u64::from(height)));
}

// Off-strand, concurrent by block.
fn validate_block<S: KeyValueStore>(shared: &Arc<Shared<S>>, task: ValidateTask) {
    if !shared.node.closed() {
        let result = validate_one(shared, task.link, task.bypass);
        complete_block(shared, result, task.link, task.height, task.bypass);
    }

    // Prevent stall by posting an internal bump, avoiding external handlers.
    if shared.backlog.fetch_sub(1, Ordering::Relaxed) == 1 {
        let _ = shared.own.send(ChaseEvent::new(Chase::Bump, 0));
    }
}

fn validate_one<S: KeyValueStore>(
    shared: &Arc<Shared<S>>,
    link: HeaderLink,
    bypass: bool,
) -> Result<(), VError> {
    let archive = &shared.node.archive;
    let block = archive.get_block(link).map_err(|_| VError::Fatal(2))?;
    let ctx = archive.get_context(link).map_err(|_| VError::Fatal(3))?;

    let populated = if bypass {
        archive.populate_without_metadata(&block)
    } else {
        archive.populate_with_metadata(&block)
    };
    let prevouts = match populated {
        Ok(prevouts) => prevouts,
        Err(ArchiveError::Validation(err)) => {
            if archive.set_block_unconfirmable(link).is_err() {
                return Err(VError::Fatal(4));
            }
            return Err(VError::Invalid(err.to_string()));
        }
        Err(_) => return Err(VError::Fatal(2)),
    };

    if !bypass {
        let mut flags = 0;
        if ctx.forks.active(Deployment::Bip16) {
            flags |= SCRIPT_VERIFY_P2SH;
        }
        if ctx.forks.active(Deployment::Segwit) {
            flags |= SCRIPT_VERIFY_WITNESS;
        }
        let accepted = accept_block(&block, &ctx, &prevouts, archive.params())
            .and_then(|fees| connect_block(&block, &prevouts, flags).map(|_| fees));
        match accepted {
            Ok(fees) => {
                if archive.set_prevouts(link, &prevouts).is_err() {
                    return Err(VError::Fatal(6));
                }
                if archive.filter_enabled() && archive.set_filter_body(link, &block).is_err() {
                    return Err(VError::Fatal(7));
                }
                if archive.set_block_valid(link, fees).is_err() {
                    return Err(VError::Fatal(8));
                }
            }
            Err(err) => {
                if archive.set_block_unconfirmable(link).is_err() {
                    return Err(VError::Fatal(5));
                }
                return Err(VError::Invalid(err.to_string()));
            }
        }
    } else {
        if archive.set_prevouts(link, &prevouts).is_err() {
            return Err(VError::Fatal(6));
        }
        if archive.filter_enabled() && archive.set_filter_body(link, &block).is_err() {
            return Err(VError::Fatal(7));
        }
    }

    Ok(())
}

enum VError {
    /// Block rule violation; the link is already marked unconfirmable.
    Invalid(String),
    /// Fatal step number, mirrored into the fault code.
    Fatal(u8),
}

// May run on any worker; publishes only bus events.
fn complete_block<S>(
    shared: &Arc<Shared<S>>,
    result: Result<(), VError>,
    link: HeaderLink,
    height: u32,
    bypass: bool,
) {
    match result {
        Ok(()) => {
            shared
                .node
                .bus
                .publish(ChaseEvent::new(Chase::Valid, u64::from(height)));
            if bypass {
                bn_log::log_trace!("block validated (bypass): {height}");
            } else {
                bn_log::log_trace!("block validated: {height}");
            }
        }
        Err(VError::Invalid(reason)) => {
            shared
                .node
                .bus
                .publish(ChaseEvent::new(Chase::Unvalid, u64::from(link.0)));
            bn_log::log_remote!("invalid block [{height}]: {reason}");
        }
        Err(VError::Fatal(step)) => {
            bn_log::log_error!("fault validating [{height}]");
            shared.node.fault(FaultCode::Validate(step));
        }
    }
}
