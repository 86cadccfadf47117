// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Partition host: one task owns one partition.
//!
//! All mutable partition state lives inside a single spawned task; clients
//! talk to it through a cloneable handle over a command channel. Retention
//! advancement, heartbeat expiry, and finalize retries run as cooperative
//! ticks on the same task, so nothing ever touches partition state
//! concurrently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{
    Deadline, InspectAllKeysResponse, InspectAllTxnsResponse, InspectRecordsResponse,
    InspectTxnResponse, InspectWriteIntentsResponse, PushSchemaRequest, PushSchemaResponse,
    QueryRequest, QueryResponse, ReadRequest, ReadResponse, Status, TxnEndRequest,
    TxnEndResponse, TxnFinalizeRequest, TxnFinalizeResponse, TxnHeartbeatRequest,
    TxnHeartbeatResponse, TxnPushRequest, TxnPushResponse, WriteRequest, WriteResponse,
};
use crate::schema::Key;
use crate::txn::TxnId;

use super::PartitionModule;

const FINALIZE_BACKOFF_BASE: Duration = Duration::from_millis(100);
const FINALIZE_BACKOFF_MAX: Duration = Duration::from_secs(5);
const FINALIZE_ATTEMPT_BUDGET: Duration = Duration::from_secs(2);

enum Command {
    Read(ReadRequest, Deadline, oneshot::Sender<Result<ReadResponse, Status>>),
    Write(WriteRequest, Deadline, oneshot::Sender<Result<WriteResponse, Status>>),
    Query(QueryRequest, Deadline, oneshot::Sender<Result<QueryResponse, Status>>),
    TxnPush(TxnPushRequest, Deadline, oneshot::Sender<Result<TxnPushResponse, Status>>),
    TxnEnd(TxnEndRequest, Deadline, oneshot::Sender<Result<TxnEndResponse, Status>>),
    TxnHeartbeat(
        TxnHeartbeatRequest,
        Deadline,
        oneshot::Sender<Result<TxnHeartbeatResponse, Status>>,
    ),
    TxnFinalize(
        TxnFinalizeRequest,
        Deadline,
        oneshot::Sender<Result<TxnFinalizeResponse, Status>>,
    ),
    PushSchema(
        PushSchemaRequest,
        Deadline,
        oneshot::Sender<Result<PushSchemaResponse, Status>>,
    ),
    InspectRecords(Key, oneshot::Sender<InspectRecordsResponse>),
    InspectTxn(TxnId, oneshot::Sender<Option<InspectTxnResponse>>),
    InspectWriteIntents(oneshot::Sender<InspectWriteIntentsResponse>),
    InspectAllTxns(oneshot::Sender<InspectAllTxnsResponse>),
    InspectAllKeys(oneshot::Sender<InspectAllKeysResponse>),
    Checkpoint(oneshot::Sender<Result<(), Status>>),
    Shutdown,
}

/// Spawns partition tasks.
pub struct PartitionHost;

impl PartitionHost {
    /// Moves the module into its own task and returns the client handle.
    pub fn spawn(module: PartitionModule) -> PartitionClient {
        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(run(module, rx));
        PartitionClient { tx }
    }
}

/// Cloneable handle to a hosted partition.
#[derive(Clone)]
pub struct PartitionClient {
    tx: mpsc::Sender<Command>,
}

macro_rules! verb {
    ($name:ident, $variant:ident, $req:ty, $resp:ty) => {
        pub async fn $name(&self, request: $req, deadline: Deadline) -> Result<$resp, Status> {
            let (tx, rx) = oneshot::channel();
            self.tx
                .send(Command::$variant(request, deadline, tx))
                .await
                .map_err(|_| Status::Gone("partition stopped".to_string()))?;
            rx.await
                .map_err(|_| Status::Gone("partition stopped".to_string()))?
        }
    };
}

impl PartitionClient {
    verb!(read, Read, ReadRequest, ReadResponse);
    verb!(write, Write, WriteRequest, WriteResponse);
    verb!(query, Query, QueryRequest, QueryResponse);
    verb!(txn_push, TxnPush, TxnPushRequest, TxnPushResponse);
    verb!(txn_end, TxnEnd, TxnEndRequest, TxnEndResponse);
    verb!(txn_heartbeat, TxnHeartbeat, TxnHeartbeatRequest, TxnHeartbeatResponse);
    verb!(txn_finalize, TxnFinalize, TxnFinalizeRequest, TxnFinalizeResponse);
    verb!(push_schema, PushSchema, PushSchemaRequest, PushSchemaResponse);

    pub async fn inspect_records(&self, key: Key) -> Result<InspectRecordsResponse, Status> {
        self.inspect(|tx| Command::InspectRecords(key, tx)).await
    }

    pub async fn inspect_txn(&self, txn_id: TxnId) -> Result<Option<InspectTxnResponse>, Status> {
        self.inspect(|tx| Command::InspectTxn(txn_id, tx)).await
    }

    pub async fn inspect_write_intents(&self) -> Result<InspectWriteIntentsResponse, Status> {
        self.inspect(Command::InspectWriteIntents).await
    }

    pub async fn inspect_all_txns(&self) -> Result<InspectAllTxnsResponse, Status> {
        self.inspect(Command::InspectAllTxns).await
    }

    pub async fn inspect_all_keys(&self) -> Result<InspectAllKeysResponse, Status> {
        self.inspect(Command::InspectAllKeys).await
    }

    pub async fn checkpoint(&self) -> Result<(), Status> {
        self.inspect(Command::Checkpoint).await?
    }

    /// Stops the partition task after in-flight commands drain.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn inspect<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Status> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| Status::Gone("partition stopped".to_string()))?;
        rx.await
            .map_err(|_| Status::Gone("partition stopped".to_string()))
    }
}

struct FinalizeRetry {
    attempts: u32,
    next_due: Instant,
}

async fn run(mut module: PartitionModule, mut rx: mpsc::Receiver<Command>) {
    let heartbeat_interval = module.config().heartbeat_interval;
    let retention_interval = (module.config().retention_window / 10)
        .max(heartbeat_interval);

    let mut expiry_tick = tokio::time::interval(heartbeat_interval);
    let mut retention_tick = tokio::time::interval(retention_interval);

    let mut retries: HashMap<TxnId, FinalizeRetry> = HashMap::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(cmd) => dispatch(&mut module, cmd).await,
                }
            }
            _ = expiry_tick.tick() => {
                if let Err(e) = module.handle_expiry_tick().await {
                    warn!(error = %e, "expiry tick failed");
                }
                drive_pending_finalizes(&mut module, &mut retries).await;
            }
            _ = retention_tick.tick() => {
                if let Err(e) = module.handle_retention_tick().await {
                    warn!(error = %e, "retention tick failed");
                }
            }
        }
    }
    debug!("partition task stopped");
}

/// Retries unconverged finalizes with exponential backoff. Finalize must
/// converge: the decision is durable and application is idempotent.
async fn drive_pending_finalizes(
    module: &mut PartitionModule,
    retries: &mut HashMap<TxnId, FinalizeRetry>,
) {
    let now = Instant::now();
    let pending = module.pending_finalizes();
    retries.retain(|txn, _| pending.contains(txn));

    for txn_id in pending {
        let due = retries
            .get(&txn_id)
            .map(|r| r.next_due)
            .unwrap_or(now);
        if due > now {
            continue;
        }
        let deadline = Deadline::after(FINALIZE_ATTEMPT_BUDGET);
        match module.drive_finalize(&txn_id, &deadline).await {
            Ok(()) => {
                retries.remove(&txn_id);
            }
            Err(e) => {
                let entry = retries.entry(txn_id.clone()).or_insert(FinalizeRetry {
                    attempts: 0,
                    next_due: now,
                });
                entry.attempts += 1;
                let backoff = FINALIZE_BACKOFF_BASE
                    .saturating_mul(1u32 << entry.attempts.min(10))
                    .min(FINALIZE_BACKOFF_MAX);
                entry.next_due = now + backoff;
                warn!(
                    txn = %txn_id,
                    attempts = entry.attempts,
                    error = %e,
                    "finalize attempt failed; backing off"
                );
            }
        }
    }
}

async fn dispatch(module: &mut PartitionModule, cmd: Command) {
    match cmd {
        Command::Read(req, deadline, reply) => {
            let _ = reply.send(module.handle_read(req, deadline).await);
        }
        Command::Write(req, deadline, reply) => {
            let _ = reply.send(module.handle_write(req, deadline).await);
        }
        Command::Query(req, deadline, reply) => {
            let _ = reply.send(module.handle_query(req, deadline).await);
        }
        Command::TxnPush(req, deadline, reply) => {
            let _ = reply.send(module.handle_txn_push(req, deadline).await);
        }
        Command::TxnEnd(req, deadline, reply) => {
            let _ = reply.send(module.handle_txn_end(req, deadline).await);
        }
        Command::TxnHeartbeat(req, deadline, reply) => {
            let _ = reply.send(module.handle_txn_heartbeat(req, deadline).await);
        }
        Command::TxnFinalize(req, deadline, reply) => {
            let _ = reply.send(module.handle_txn_finalize(req, deadline).await);
        }
        Command::PushSchema(req, deadline, reply) => {
            let _ = reply.send(module.handle_push_schema(req, deadline).await);
        }
        Command::InspectRecords(key, reply) => {
            let _ = reply.send(module.inspect_records(&key));
        }
        Command::InspectTxn(txn_id, reply) => {
            let _ = reply.send(module.inspect_txn(&txn_id));
        }
        Command::InspectWriteIntents(reply) => {
            let _ = reply.send(module.inspect_write_intents());
        }
        Command::InspectAllTxns(reply) => {
            let _ = reply.send(module.inspect_all_txns());
        }
        Command::InspectAllKeys(reply) => {
            let _ = reply.send(module.inspect_all_keys());
        }
        Command::Checkpoint(reply) => {
            let _ = reply.send(module.checkpoint().await);
        }
        Command::Shutdown => {}
    }
}
