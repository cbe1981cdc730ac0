//! Per-truck actor: a single task owns one [`Truck`] exclusively and
//! serializes every operation against it through a command channel. This is
//! what lets many callers share a truck without a lock around the engine
//! itself — only one command is ever in flight inside the engine at a time,
//! by construction rather than by mutex.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::error::{Result, TruckDbError};
use crate::truck::Truck;
use crate::value::Value;

const COMMAND_QUEUE_DEPTH: usize = 64;

enum Command {
    Write {
        box_id: String,
        tag: String,
        value: Value,
        sync: bool,
        /// `None` for a fire-and-forget send: the worker still applies the
        /// write in order, it just has nobody to report the result to.
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    PutCas {
        box_id: String,
        tag: String,
        value: Value,
        field: String,
        expected: Value,
        sync: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    Batch {
        box_id: String,
        entries: Vec<(String, Value)>,
        reply: oneshot::Sender<Result<()>>,
    },
    Read {
        box_id: String,
        tag: String,
        reply: oneshot::Sender<Result<Option<Value>>>,
    },
    ReadBox {
        box_id: String,
        reply: oneshot::Sender<Result<Vec<(String, Value)>>>,
    },
    Query {
        box_id: String,
        field: String,
        prefix: String,
        reply: oneshot::Sender<Result<Vec<Value>>>,
    },
    Contains {
        box_id: String,
        tag: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    RemoveTag {
        box_id: String,
        tag: String,
        sync: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    RemoveBox {
        box_id: String,
        sync: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    GetAllBoxes {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Compact {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A handle to a running truck actor. Cloning a handle is cheap (it clones
/// the channel sender); the actor itself stops when the last handle is
/// dropped and the channel closes.
#[derive(Clone)]
pub struct TruckWorkerHandle {
    id: String,
    tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl TruckWorkerHandle {
    /// Spawns the actor task that owns `truck` and returns a handle to it.
    pub fn spawn(truck: Truck, timeout: Duration) -> Self {
        let id = truck.id().to_string();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(run(truck, rx));
        Self { id, tx, timeout }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call<T>(&self, make_cmd: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = make_cmd(reply_tx);
        if self.tx.send(cmd).await.is_err() {
            return Err(TruckDbError::WorkerGone);
        }
        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TruckDbError::WorkerGone),
            Err(_) => Err(TruckDbError::Timeout(self.timeout)),
        }
    }

    /// Enqueues `cmd` without waiting for the worker to process it. The
    /// worker still applies it in strict arrival order relative to every
    /// other command; only the caller's wait for I/O completion is skipped.
    async fn send_detached(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| TruckDbError::WorkerGone)
    }

    pub async fn write(&self, box_id: impl Into<String>, tag: impl Into<String>, value: Value, sync: bool) -> Result<()> {
        let box_id = box_id.into();
        let tag = tag.into();
        self.call(|reply| Command::Write { box_id, tag, value, sync, reply: Some(reply) }).await
    }

    /// Fire-and-forget `write`: returns as soon as the command is enqueued,
    /// without waiting for the worker to apply it.
    pub async fn write_detached(&self, box_id: impl Into<String>, tag: impl Into<String>, value: Value, sync: bool) -> Result<()> {
        let box_id = box_id.into();
        let tag = tag.into();
        self.send_detached(Command::Write { box_id, tag, value, sync, reply: None }).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn put_cas(
        &self,
        box_id: impl Into<String>,
        tag: impl Into<String>,
        value: Value,
        field: impl Into<String>,
        expected: Value,
        sync: bool,
    ) -> Result<bool> {
        let box_id = box_id.into();
        let tag = tag.into();
        let field = field.into();
        self.call(|reply| Command::PutCas {
            box_id,
            tag,
            value,
            field,
            expected,
            sync,
            reply,
        })
        .await
    }

    pub async fn batch(&self, box_id: impl Into<String>, entries: Vec<(String, Value)>) -> Result<()> {
        let box_id = box_id.into();
        self.call(|reply| Command::Batch { box_id, entries, reply }).await
    }

    pub async fn read(&self, box_id: impl Into<String>, tag: impl Into<String>) -> Result<Option<Value>> {
        let box_id = box_id.into();
        let tag = tag.into();
        self.call(|reply| Command::Read { box_id, tag, reply }).await
    }

    pub async fn read_box(&self, box_id: impl Into<String>) -> Result<Vec<(String, Value)>> {
        let box_id = box_id.into();
        self.call(|reply| Command::ReadBox { box_id, reply }).await
    }

    pub async fn query(
        &self,
        box_id: impl Into<String>,
        field: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Result<Vec<Value>> {
        let box_id = box_id.into();
        let field = field.into();
        let prefix = prefix.into();
        self.call(|reply| Command::Query { box_id, field, prefix, reply }).await
    }

    pub async fn contains(&self, box_id: impl Into<String>, tag: impl Into<String>) -> Result<bool> {
        let box_id = box_id.into();
        let tag = tag.into();
        self.call(|reply| Command::Contains { box_id, tag, reply }).await
    }

    pub async fn remove_tag(&self, box_id: impl Into<String>, tag: impl Into<String>, sync: bool) -> Result<()> {
        let box_id = box_id.into();
        let tag = tag.into();
        self.call(|reply| Command::RemoveTag { box_id, tag, sync, reply: Some(reply) }).await
    }

    /// Fire-and-forget `remove_tag`.
    pub async fn remove_tag_detached(&self, box_id: impl Into<String>, tag: impl Into<String>, sync: bool) -> Result<()> {
        let box_id = box_id.into();
        let tag = tag.into();
        self.send_detached(Command::RemoveTag { box_id, tag, sync, reply: None }).await
    }

    pub async fn remove_box(&self, box_id: impl Into<String>, sync: bool) -> Result<()> {
        let box_id = box_id.into();
        self.call(|reply| Command::RemoveBox { box_id, sync, reply: Some(reply) }).await
    }

    /// Fire-and-forget `remove_box`.
    pub async fn remove_box_detached(&self, box_id: impl Into<String>, sync: bool) -> Result<()> {
        let box_id = box_id.into();
        self.send_detached(Command::RemoveBox { box_id, sync, reply: None }).await
    }

    pub async fn get_all_boxes(&self) -> Result<Vec<String>> {
        self.call(|reply| Command::GetAllBoxes { reply }).await
    }

    pub async fn compact(&self) -> Result<()> {
        self.call(|reply| Command::Compact { reply }).await
    }

    /// Flushes and closes the truck, then waits for the actor task to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.call(|reply| Command::Close { reply }).await
    }
}

async fn run(mut truck: Truck, mut rx: mpsc::Receiver<Command>) {
    loop {
        let sleep_deadline = truck.flush_deadline().unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            biased;
            maybe_cmd = rx.recv() => {
                match maybe_cmd {
                    Some(cmd) => {
                        let should_stop = matches!(cmd, Command::Close { .. });
                        dispatch(&mut truck, cmd).await;
                        if should_stop {
                            break;
                        }
                    }
                    None => break,
                }
            }
            () = sleep_until(sleep_deadline), if truck.flush_deadline().is_some() => {
                if let Err(err) = truck.flush_core().await {
                    tracing::error!(truck_id = %truck.id(), error = %err, "scheduled flush failed");
                }
            }
        }
    }
}

async fn dispatch(truck: &mut Truck, cmd: Command) {
    match cmd {
        Command::Write { box_id, tag, value, sync, reply } => {
            let result = truck.write(&box_id, &tag, value, sync).await;
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        Command::PutCas { box_id, tag, value, field, expected, sync, reply } => {
            let _ = reply.send(truck.put_cas(&box_id, &tag, value, &field, &expected, sync).await);
        }
        Command::Batch { box_id, entries, reply } => {
            let _ = reply.send(truck.batch(&box_id, entries).await);
        }
        Command::Read { box_id, tag, reply } => {
            let _ = reply.send(truck.read(&box_id, &tag).await);
        }
        Command::ReadBox { box_id, reply } => {
            let _ = reply.send(truck.read_box(&box_id).await);
        }
        Command::Query { box_id, field, prefix, reply } => {
            let _ = reply.send(truck.query(&box_id, &field, &prefix).await);
        }
        Command::Contains { box_id, tag, reply } => {
            let _ = reply.send(truck.contains(&box_id, &tag).await);
        }
        Command::RemoveTag { box_id, tag, sync, reply } => {
            let result = truck.remove_tag(&box_id, &tag, sync).await;
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        Command::RemoveBox { box_id, sync, reply } => {
            let result = truck.remove_box(&box_id, sync).await;
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        Command::GetAllBoxes { reply } => {
            let _ = reply.send(Ok(truck.get_all_boxes()));
        }
        Command::Compact { reply } => {
            let _ = reply.send(truck.compact().await);
        }
        Command::Close { reply } => {
            let _ = reply.send(truck.close().await);
        }
    }
}
