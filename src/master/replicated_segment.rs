//! Replication state of one segment
//!
//! A `ReplicatedSegment` keeps the segment's in-memory image and one
//! `Replica` record per copy it is supposed to have on backups. Each call to
//! `perform` moves the replicas a step closer to matching the image: finished
//! RPCs are reaped, missing replicas get a backup, and the unsent suffix of
//! the image is written out. All of it runs under the manager's lock, so
//! `perform` never waits; RPCs run on spawned tasks.

use crate::common::{Error, Result, ServerId};
use crate::master::backup_selector::SelectBackup;
use crate::transport::{BackupClient, WriteSegment};
use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shared state a segment needs while making progress.
pub(crate) struct Context<'a, B> {
    pub selector: &'a mut dyn SelectBackup,
    pub client: &'a Arc<B>,
    pub master: ServerId,
    pub write_rpcs_in_flight: &'a mut u32,
    pub max_write_rpcs_in_flight: u32,
    /// Bound on every write and free sent to a backup.
    pub rpc_timeout: Duration,
}

impl<B> Context<'_, B> {
    fn throttled(&self) -> bool {
        *self.write_rpcs_in_flight >= self.max_write_rpcs_in_flight
    }

    /// Run `rpc` on its own task, failing it with `Error::Timeout` if the
    /// backup does not answer within `rpc_timeout`.
    fn spawn_rpc<F>(&self, what: String, rpc: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let timeout = self.rpc_timeout;
        tokio::spawn(async move {
            tokio::time::timeout(timeout, rpc)
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(what)))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum RpcKind {
    /// Write ending at `end`; `close` if it completes the replica.
    Write { end: u64, close: bool },
    Free,
}

struct InFlight {
    kind: RpcKind,
    handle: JoinHandle<Result<()>>,
}

/// One copy of the segment on one backup.
#[derive(Default)]
struct Replica {
    backup: Option<ServerId>,
    locator: String,
    /// Bytes the backup has acknowledged.
    acked: u64,
    opened: bool,
    close_acked: bool,
    rpc: Option<InFlight>,
}

impl Replica {
    fn reset(&mut self) {
        *self = Replica::default();
    }

    /// Cancel the outstanding RPC, if any, and give back its throttle slot.
    fn cancel_rpc(&mut self, write_rpcs_in_flight: &mut u32) {
        if let Some(rpc) = self.rpc.take() {
            rpc.handle.abort();
            if matches!(rpc.kind, RpcKind::Write { .. }) {
                *write_rpcs_in_flight -= 1;
            }
        }
    }

    fn is_synced(&self, len: u64, closed: bool) -> bool {
        self.backup.is_some()
            && self.rpc.is_none()
            && self.opened
            && self.acked == len
            && (!closed || self.close_acked)
    }

    fn needs_write(&self, len: u64, closed: bool) -> bool {
        !self.opened || self.acked < len || (closed && !self.close_acked)
    }
}

pub struct ReplicatedSegment {
    segment_id: u64,
    image: BytesMut,
    closed: bool,
    freeing: bool,
    replicas: Vec<Replica>,
}

impl ReplicatedSegment {
    pub(crate) fn new(segment_id: u64, data: &[u8], num_replicas: u32) -> Self {
        Self {
            segment_id,
            image: BytesMut::from(data),
            closed: false,
            freeing: false,
            replicas: (0..num_replicas).map(|_| Replica::default()).collect(),
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn len(&self) -> u64 {
        self.image.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.closed || self.freeing {
            return Err(Error::Internal(format!(
                "append to closed segment {}",
                self.segment_id
            )));
        }
        self.image.extend_from_slice(data);
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn free(&mut self) {
        self.freeing = true;
    }

    /// Every replica holds the whole image (and knows it is closed, if it
    /// is).
    pub fn is_synced(&self) -> bool {
        let len = self.len();
        !self.freeing && self.replicas.iter().all(|r| r.is_synced(len, self.closed))
    }

    /// Backups currently assigned a replica of this segment.
    pub fn backups(&self) -> Vec<ServerId> {
        self.replicas.iter().filter_map(|r| r.backup).collect()
    }

    /// Forget every replica on `backup`; they are rebuilt elsewhere from
    /// scratch on later calls to `perform`.
    pub(crate) fn handle_backup_failure(&mut self, backup: ServerId, write_rpcs_in_flight: &mut u32) {
        for replica in self.replicas.iter_mut().filter(|r| r.backup == Some(backup)) {
            replica.cancel_rpc(write_rpcs_in_flight);
            replica.reset();
            if !self.freeing {
                tracing::info!(
                    "Segment {} lost its replica on backup {}; re-replicating",
                    self.segment_id,
                    backup
                );
            }
        }
    }

    /// Make whatever progress is possible without waiting. Returns true
    /// once a freed segment has released all its replicas.
    pub(crate) fn perform<B: BackupClient>(&mut self, ctx: &mut Context<'_, B>) -> bool {
        self.reap(ctx);
        if self.freeing {
            return self.perform_free(ctx);
        }

        for i in 0..self.replicas.len() {
            if self.replicas[i].rpc.is_some() {
                continue;
            }
            if self.replicas[i].backup.is_none() && !self.choose_backup(i, ctx) {
                continue;
            }
            if !self.replicas[i].needs_write(self.len(), self.closed) {
                continue;
            }
            if ctx.throttled() {
                break;
            }
            self.send_write(i, ctx);
        }
        false
    }

    /// Collect the results of finished RPCs.
    fn reap<B>(&mut self, ctx: &mut Context<'_, B>) {
        for (i, replica) in self.replicas.iter_mut().enumerate() {
            let finished = replica.rpc.as_ref().is_some_and(|rpc| rpc.handle.is_finished());
            if !finished {
                continue;
            }
            let Some(mut rpc) = replica.rpc.take() else {
                continue;
            };
            let result = match (&mut rpc.handle).now_or_never() {
                Some(Ok(result)) => result,
                Some(Err(e)) => Err(Error::Internal(format!("rpc task failed: {}", e))),
                None => Err(Error::Internal("rpc task not finished".into())),
            };

            match rpc.kind {
                RpcKind::Write { end, close } => {
                    *ctx.write_rpcs_in_flight -= 1;
                    match result {
                        Ok(()) => {
                            replica.opened = true;
                            replica.acked = end;
                            replica.close_acked |= close;
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Write of segment {} to {} failed: {}; choosing another backup",
                                self.segment_id,
                                replica.locator,
                                e
                            );
                            if let (0, Some(backup)) = (i, replica.backup) {
                                ctx.selector.release_primary(backup);
                            }
                            replica.reset();
                        }
                    }
                }
                RpcKind::Free => {
                    if let Err(e) = result {
                        tracing::debug!(
                            "Free of segment {} on {} failed: {}",
                            self.segment_id,
                            replica.locator,
                            e
                        );
                    }
                    if let (0, Some(backup)) = (i, replica.backup) {
                        ctx.selector.release_primary(backup);
                    }
                    replica.reset();
                }
            }
        }
    }

    fn perform_free<B: BackupClient>(&mut self, ctx: &mut Context<'_, B>) -> bool {
        for replica in self.replicas.iter_mut() {
            if matches!(replica.rpc, Some(InFlight { kind: RpcKind::Write { .. }, .. })) {
                replica.cancel_rpc(ctx.write_rpcs_in_flight);
            }
            if replica.rpc.is_some() {
                continue;
            }
            let Some(backup) = replica.backup else {
                continue;
            };

            let client = ctx.client.clone();
            let locator = replica.locator.clone();
            let master = ctx.master;
            let segment_id = self.segment_id;
            let what = format!("free of segment {} on {}", segment_id, locator);
            let handle = ctx.spawn_rpc(what, async move {
                client.free_segment(backup, &locator, master, segment_id).await
            });
            replica.rpc = Some(InFlight {
                kind: RpcKind::Free,
                handle,
            });
        }

        self.replicas.iter().all(|r| r.backup.is_none() && r.rpc.is_none())
    }

    /// Pick a backup for replica `i`. The first replica is the primary.
    fn choose_backup<B>(&mut self, i: usize, ctx: &mut Context<'_, B>) -> bool {
        let others: Vec<ServerId> = self
            .replicas
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .filter_map(|(_, r)| r.backup)
            .collect();

        let selected = if i == 0 {
            ctx.selector.select_primary(&others)
        } else {
            ctx.selector.select_secondary(&others)
        };
        let backup = match selected {
            Ok(backup) => backup,
            Err(e) if e.is_retryable() => {
                tracing::debug!(
                    "No backup for replica {} of segment {} yet: {}",
                    i,
                    self.segment_id,
                    e
                );
                return false;
            }
            Err(e) => {
                tracing::warn!("Backup selection for segment {} failed: {}", self.segment_id, e);
                return false;
            }
        };
        let locator = match ctx.selector.locate(backup) {
            Ok(locator) => locator,
            Err(e) => {
                tracing::debug!("Chosen backup {} vanished: {}", backup, e);
                return false;
            }
        };

        let replica = &mut self.replicas[i];
        replica.reset();
        replica.backup = Some(backup);
        replica.locator = locator;
        true
    }

    fn send_write<B: BackupClient>(&mut self, i: usize, ctx: &mut Context<'_, B>) {
        let len = self.len();
        let replica = &mut self.replicas[i];
        let Some(backup) = replica.backup else {
            return;
        };

        let request = WriteSegment {
            backup,
            locator: replica.locator.clone(),
            master: ctx.master,
            segment_id: self.segment_id,
            offset: replica.acked,
            data: Bytes::copy_from_slice(&self.image[replica.acked as usize..]),
            open: !replica.opened,
            close: self.closed,
        };
        tracing::trace!(
            "Writing segment {} [{}, {}) to {}",
            self.segment_id,
            request.offset,
            len,
            request.locator
        );

        let client = ctx.client.clone();
        let what = format!("write of segment {} to {}", self.segment_id, request.locator);
        let handle = ctx.spawn_rpc(what, async move { client.write_segment(request).await });
        *ctx.write_rpcs_in_flight += 1;
        replica.rpc = Some(InFlight {
            kind: RpcKind::Write {
                end: len,
                close: self.closed,
            },
            handle,
        });
    }
}

impl Drop for ReplicatedSegment {
    fn drop(&mut self) {
        for replica in self.replicas.iter_mut() {
            if let Some(rpc) = replica.rpc.take() {
                rpc.handle.abort();
            }
        }
    }
}
