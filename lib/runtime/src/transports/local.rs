// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport mesh.
//!
//! [`LocalMesh::new`] builds a fully-connected set of [`LocalEndpoint`]s,
//! one per rank. Delivery is a lock-push into the destination's mailbox;
//! ordering is preserved per sender-receiver pair. Acknowledged broadcasts
//! complete when every worker has *dequeued* the message, not merely
//! received it into its mailbox.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::EngineError;
use crate::protocols::{Message, Tag};
use crate::transports::{Rank, Transport};

struct Envelope {
    src: Rank,
    needs_ack: bool,
    msg: Message,
}

/// One peer's inbox: arrival-ordered envelopes plus a wakeup for blocked
/// receivers.
struct Mailbox {
    queue: Mutex<Option<VecDeque<Envelope>>>,
    notify: Notify,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(Some(VecDeque::new())),
            notify: Notify::new(),
        }
    }

    fn push(&self, env: Envelope) -> Result<()> {
        let mut guard = self.queue.lock();
        match guard.as_mut() {
            Some(queue) => {
                queue.push_back(env);
                drop(guard);
                self.notify.notify_waiters();
                Ok(())
            }
            None => Err(EngineError::transport("peer mailbox is closed").into()),
        }
    }

    /// Remove the earliest envelope matching `filter`, if any.
    fn take<F: Fn(&Envelope) -> bool>(&self, filter: F) -> Option<Envelope> {
        let mut guard = self.queue.lock();
        let queue = guard.as_mut()?;
        let idx = queue.iter().position(filter)?;
        queue.remove(idx)
    }

    fn close(&self) {
        *self.queue.lock() = None;
        self.notify.notify_waiters();
    }
}

/// A fully-connected in-process peer set.
pub struct LocalMesh {
    mailboxes: Vec<Arc<Mailbox>>,
}

impl LocalMesh {
    /// Build a mesh of `num_workers + 1` peers and hand back one endpoint
    /// per rank, master first.
    pub fn new(num_workers: usize) -> Vec<LocalEndpoint> {
        let mailboxes: Vec<Arc<Mailbox>> = (0..=num_workers)
            .map(|_| Arc::new(Mailbox::new()))
            .collect();
        let mesh = Arc::new(LocalMesh { mailboxes });
        (0..=num_workers)
            .map(|rank| LocalEndpoint {
                rank,
                mesh: mesh.clone(),
            })
            .collect()
    }
}

/// One rank's handle onto a [`LocalMesh`].
pub struct LocalEndpoint {
    rank: Rank,
    mesh: Arc<LocalMesh>,
}

impl LocalEndpoint {
    fn deliver(&self, dest: Rank, env: Envelope) -> Result<()> {
        let mailbox = self
            .mesh
            .mailboxes
            .get(dest)
            .ok_or_else(|| EngineError::transport(format!("no peer with rank {dest}")))?;
        mailbox.push(env)
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mesh.mailboxes[self.rank]
    }

    /// Dequeue an envelope, acknowledging it if the sender asked for one.
    fn consume(&self, env: Envelope) -> (Rank, Message) {
        if env.needs_ack {
            // Ack delivery failure means the sender is gone; nothing to do.
            let _ = self.deliver(
                env.src,
                Envelope {
                    src: self.rank,
                    needs_ack: false,
                    msg: Message::Ack,
                },
            );
        }
        (env.src, env.msg)
    }

    async fn recv_matching<F: Fn(&Envelope) -> bool + Copy>(
        &self,
        filter: F,
    ) -> Result<(Rank, Message)> {
        loop {
            let notified = self.mailbox().notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before the check so a push between the
            // check and the await is not lost.
            notified.as_mut().enable();
            if let Some(env) = self.mailbox().take(filter) {
                return Ok(self.consume(env));
            }
            if self.mailbox().queue.lock().is_none() {
                return Err(EngineError::transport("mailbox closed while receiving").into());
            }
            notified.await;
        }
    }

    /// Tear down this rank's mailbox. Subsequent sends to it fail.
    pub fn close(&self) {
        self.mailbox().close();
    }
}

#[async_trait]
impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_peers(&self) -> usize {
        self.mesh.mailboxes.len()
    }

    async fn send(&self, dest: Rank, msg: Message) -> Result<()> {
        self.deliver(
            dest,
            Envelope {
                src: self.rank,
                needs_ack: false,
                msg,
            },
        )
    }

    async fn broadcast(&self, msg: Message) -> Result<()> {
        for dest in 1..self.num_peers() {
            self.deliver(
                dest,
                Envelope {
                    src: self.rank,
                    needs_ack: false,
                    msg: msg.clone(),
                },
            )?;
        }
        Ok(())
    }

    async fn sync_broadcast(&self, msg: Message) -> Result<()> {
        let num_workers = self.num_peers() - 1;
        for dest in 1..self.num_peers() {
            self.deliver(
                dest,
                Envelope {
                    src: self.rank,
                    needs_ack: true,
                    msg: msg.clone(),
                },
            )?;
        }
        let mut acked = 0;
        while acked < num_workers {
            self.recv_matching(|env| env.msg.tag() == Tag::Ack).await?;
            acked += 1;
        }
        Ok(())
    }

    fn try_recv(&self, tag: Tag) -> Option<(Rank, Message)> {
        let env = self.mailbox().take(|env| env.msg.tag() == tag)?;
        Some(self.consume(env))
    }

    async fn recv_any(&self) -> Result<(Rank, Message)> {
        // Acks are transport-internal; never surface them to the app layer.
        self.recv_matching(|env| env.msg.tag() != Tag::Ack).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::FlushResponse;
    use crate::transports::MASTER_RANK;

    fn flush_response(updates_done: u64) -> Message {
        Message::FlushResponse(FlushResponse { updates_done })
    }

    #[tokio::test]
    async fn test_tag_filtered_receive_skips_other_tags() {
        let mut peers = LocalMesh::new(1);
        let worker = peers.remove(1);
        let master = peers.remove(0);

        worker.send(MASTER_RANK, Message::WorkerFlush).await.unwrap();
        worker.send(MASTER_RANK, flush_response(2)).await.unwrap();

        // The flush response is behind the flush message but is returned
        // first when filtering by its tag.
        let (src, msg) = master.try_recv(Tag::FlushResponse).unwrap();
        assert_eq!(src, 1);
        assert!(matches!(msg, Message::FlushResponse(r) if r.updates_done == 2));

        let (_, msg) = master.try_recv(Tag::WorkerFlush).unwrap();
        assert!(matches!(msg, Message::WorkerFlush));

        assert!(master.try_recv(Tag::WorkerFlush).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_worker() {
        let mut peers = LocalMesh::new(3);
        let master = peers.remove(0);
        master.broadcast(Message::WorkerApply).await.unwrap();
        for worker in &peers {
            let (src, msg) = worker.try_recv(Tag::WorkerApply).unwrap();
            assert_eq!(src, MASTER_RANK);
            assert!(matches!(msg, Message::WorkerApply));
        }
    }

    #[tokio::test]
    async fn test_sync_broadcast_waits_for_dequeue() {
        let mut peers = LocalMesh::new(2);
        let master = peers.remove(0);
        let workers: Vec<_> = peers.into_iter().collect();

        let consumers: Vec<_> = workers
            .into_iter()
            .map(|w| {
                tokio::spawn(async move {
                    let (_, msg) = w.recv_any().await.unwrap();
                    assert!(matches!(msg, Message::WorkerFlush));
                })
            })
            .collect();

        master.sync_broadcast(Message::WorkerFlush).await.unwrap();
        for task in consumers {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_to_closed_mailbox_fails() {
        let mut peers = LocalMesh::new(1);
        let worker = peers.remove(1);
        let master = peers.remove(0);

        worker.close();
        let err = master.send(1, Message::WorkerShutdown).await.unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(crate::error::ErrorKind::Transport)
        );
    }

    #[tokio::test]
    async fn test_recv_any_never_surfaces_acks() {
        let mut peers = LocalMesh::new(1);
        let worker = peers.remove(1);
        let master = peers.remove(0);

        worker.send(MASTER_RANK, Message::Ack).await.unwrap();
        worker.send(MASTER_RANK, flush_response(0)).await.unwrap();

        let (_, msg) = master.recv_any().await.unwrap();
        assert!(matches!(msg, Message::FlushResponse(_)));
    }
}
