// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The transactional partition module.
//!
//! One instance owns all mutable state for one partition of a collection:
//! the versioned indexer, the read cache, and the transaction-record table
//! for every transaction whose routing key lies here. Methods take
//! `&mut self` and are async; every await is a suspension point and all
//! mutations between suspensions are atomic with respect to the partition.
//!
//! # Durability discipline
//!
//! Every externally visible effect follows a successful persistence flush
//! covering its causing appends: write-intents are persisted before they are
//! installed in the indexer, and transaction transitions are persisted
//! before they are applied in memory. The log order is therefore
//! authoritative for races such as Commit vs. concurrent ForceAbort.

pub mod config;
pub mod host;
pub mod indexer;
pub mod read_cache;
pub mod scan;

pub use config::PartitionConfig;
pub use host::{PartitionClient, PartitionHost};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::persistence::{CheckpointImage, LogError, LogRecord, Persistence, TxnImage};
use crate::protocol::{
    Deadline, InspectAllKeysResponse, InspectAllTxnsResponse, InspectRecordsResponse,
    InspectTxnResponse, InspectWriteIntentsResponse, PartitionLocator, PartitionMeta,
    PushSchemaRequest, PushSchemaResponse, QueryRequest, QueryResponse, ReadRequest,
    ReadResponse, Status, TxnEndRequest, TxnEndResponse, TxnFinalizeRequest,
    TxnFinalizeResponse, TxnHeartbeatRequest, TxnHeartbeatResponse, TxnPushRequest,
    TxnPushResponse, TxnTransport, WriteRequest, WriteResponse,
};
use crate::schema::{Key, Record, Schema};
use crate::time::{Clock, Timestamp};
use crate::txn::{EndAction, Mtr, TxnError, TxnId, TxnManager, TxnState};

use indexer::{Indexer, IndexerError, Version, VersionBody};
use read_cache::ReadCache;
use scan::{eval_filter, scan_bounds, PageBudget};

/// One partition of a collection: verb dispatch, validation, and
/// orchestration of the indexer, read cache, transaction manager, PUSH
/// resolution, and persistence.
pub struct PartitionModule {
    meta: PartitionMeta,
    config: PartitionConfig,
    clock: Arc<Clock>,
    locator: Arc<dyn PartitionLocator>,
    transport: Arc<dyn TxnTransport>,
    schemas: HashMap<String, BTreeMap<u32, Arc<Schema>>>,
    indexer: Indexer,
    read_cache: ReadCache,
    txns: TxnManager,
    log: Box<dyn Persistence>,
    retention_ts: Timestamp,
    halted: bool,
}

impl PartitionModule {
    /// Brings up a fresh partition.
    pub async fn start(
        meta: PartitionMeta,
        config: PartitionConfig,
        clock: Arc<Clock>,
        locator: Arc<dyn PartitionLocator>,
        transport: Arc<dyn TxnTransport>,
        log: Box<dyn Persistence>,
    ) -> Result<Self, Status> {
        let now = clock.now().await.map_err(|e| Status::ServiceUnavailable(e.to_string()))?;
        let retention_ts = now.sub_window(config.retention_window);
        info!(
            collection = %meta.collection,
            pvid = meta.pvid,
            retention = %retention_ts,
            "partition starting"
        );
        Ok(Self {
            read_cache: ReadCache::new(config.read_cache_size, retention_ts),
            txns: TxnManager::new(config.txn_expiry),
            meta,
            clock,
            locator,
            transport,
            schemas: HashMap::new(),
            indexer: Indexer::new(),
            log,
            retention_ts,
            config,
            halted: false,
        })
    }

    /// Brings up a partition from a replayed persistence log.
    ///
    /// Replay is idempotent: intents install once, transitions are monotone
    /// on the state lattice, and finalizes fold intents into committed
    /// versions exactly once.
    pub async fn recover(
        meta: PartitionMeta,
        config: PartitionConfig,
        clock: Arc<Clock>,
        locator: Arc<dyn PartitionLocator>,
        transport: Arc<dyn TxnTransport>,
        log: Box<dyn Persistence>,
        records: Vec<(crate::persistence::Lsn, LogRecord)>,
    ) -> Result<Self, Status> {
        let mut module = Self::start(meta, config, clock, locator, transport, log).await?;
        let count = records.len();
        for (_, record) in records {
            module.apply_replayed(record);
        }
        info!(replayed = count, "partition recovered");
        Ok(module)
    }

    fn apply_replayed(&mut self, record: LogRecord) {
        let now = Instant::now();
        match record {
            LogRecord::Checkpoint(image) => {
                self.indexer = Indexer::restore(image.versions);
                self.txns = TxnManager::new(self.config.txn_expiry);
                for txn in image.txns {
                    self.txns.restore(
                        txn.txn_id,
                        txn.state,
                        txn.write_keys,
                        txn.has_intent,
                        now,
                    );
                }
                self.retention_ts = self.retention_ts.max(image.retention_ts);
            }
            LogRecord::IntentAppend {
                key,
                timestamp,
                owner,
                value,
            } => {
                // replacing a same-transaction predecessor intent mirrors
                // the live write path
                self.indexer.abort_intent(&key, &owner);
                if let Err(e) = self.indexer.install_intent(key, timestamp, owner, value) {
                    // an intent from another transaction is already in
                    // place; a later transition resolves it
                    debug!(error = %e, "replayed intent superseded");
                }
            }
            LogRecord::TxnTransition {
                txn_id,
                state,
                write_keys,
            } => self.apply_replayed_transition(txn_id, state, write_keys, now),
        }
    }

    fn apply_replayed_transition(
        &mut self,
        txn_id: TxnId,
        state: TxnState,
        write_keys: Vec<(String, Key)>,
        now: Instant,
    ) {
        match state {
            TxnState::InProgress => {
                let _ = self.txns.create_in_progress(txn_id, now);
            }
            TxnState::ForceAborted => {
                self.txns
                    .restore(txn_id, TxnState::ForceAborted, write_keys, false, now);
            }
            TxnState::Committed | TxnState::Aborted => {
                for (collection, key) in &write_keys {
                    if *collection == self.meta.collection && self.meta.owns(key) {
                        let folded = if state == TxnState::Committed {
                            self.indexer
                                .commit_intent(key, &txn_id, txn_id.mtr.timestamp)
                                .unwrap_or(false)
                        } else {
                            self.indexer.abort_intent(key, &txn_id)
                        };
                        if folded {
                            debug!(key = %key, state = ?state, "replay folded intent");
                        }
                    }
                }
                if self.owns_trh(&txn_id) {
                    self.txns.restore(txn_id, state, write_keys, true, now);
                }
            }
            TxnState::Deleted => {
                self.txns.mark_finalized(&txn_id);
            }
        }
    }

    /// The partition's identity and owned range.
    pub fn meta(&self) -> &PartitionMeta {
        &self.meta
    }

    /// The partition's configuration.
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// The current retention horizon.
    pub fn retention_ts(&self) -> Timestamp {
        self.retention_ts
    }

    // ---- verb handlers ----

    /// Serves a snapshot read at the requesting transaction's timestamp.
    pub async fn handle_read(
        &mut self,
        request: ReadRequest,
        deadline: Deadline,
    ) -> Result<ReadResponse, Status> {
        self.ensure_live(&deadline)?;
        self.validate_read_request(&request.collection, request.pvid, &request.key, &request.mtr)?;

        // a read at t forbids any later write below t on this key
        self.read_cache.mark_key(&request.key, request.mtr.timestamp);

        let mut attempts = 0;
        loop {
            let blocking = self.blocking_intent_for_read(&request.key, &request.mtr);
            match blocking {
                BlockingIntent::Own(value) => {
                    // read-your-own-pending-write
                    return match value {
                        Some(record) => Ok(ReadResponse { record }),
                        None => Err(Status::KeyNotFound),
                    };
                }
                BlockingIntent::Other(owner) => {
                    if attempts > self.config.push_retry_max {
                        return Err(Status::AbortConflict(
                            "push retries exhausted".to_string(),
                        ));
                    }
                    attempts += 1;
                    self.resolve_intent(&request.key, owner, &request.mtr, &deadline)
                        .await?;
                }
                BlockingIntent::None => break,
            }
        }

        match self
            .indexer
            .get_version_not_newer_than(&request.key, &request.mtr.timestamp)
        {
            Some(version) => match version.committed_value() {
                Some(Some(record)) => Ok(ReadResponse {
                    record: record.clone(),
                }),
                _ => Err(Status::KeyNotFound),
            },
            None => Err(Status::KeyNotFound),
        }
    }

    /// Installs a write-intent for the requesting transaction.
    pub async fn handle_write(
        &mut self,
        request: WriteRequest,
        deadline: Deadline,
    ) -> Result<WriteResponse, Status> {
        self.ensure_live(&deadline)?;
        self.validate_partition(&request.collection, request.pvid, Some(&request.key))?;
        if !request.key.has_partition_key() {
            return Err(Status::BadParameter(
                "missing partition key in write request".to_string(),
            ));
        }
        self.validate_retention(&request.mtr)?;
        let schema = self.schema_for(&request.key.schema_name, request.value.schema_version)?;

        let txn_id = TxnId {
            collection: request.collection.clone(),
            trh_key: request.trh_key.clone(),
            mtr: request.mtr.clone(),
        };

        // resolve any conflicting intent before judging staleness: the
        // incumbent may commit under us and become the newest version
        let mut attempts = 0;
        loop {
            let other = match self.indexer.intent(&request.key) {
                Some(Version {
                    body: VersionBody::Intent { owner, .. },
                    ..
                }) if owner.mtr != request.mtr => Some(owner.clone()),
                _ => None,
            };
            let Some(owner) = other else { break };
            if attempts > self.config.push_retry_max {
                return Err(Status::AbortConflict("push retries exhausted".to_string()));
            }
            attempts += 1;
            self.resolve_intent(&request.key, owner, &request.mtr, &deadline)
                .await?;
        }

        self.validate_not_stale(&request.key, &request.mtr)?;

        let image = self.make_write_image(&schema, &request)?;

        // first write at the local TRH creates the transaction record
        let mut create_record = false;
        if self.owns_trh(&txn_id) {
            match self.txns.get(&txn_id).map(|r| r.state) {
                None => create_record = true,
                Some(TxnState::InProgress) => {}
                Some(TxnState::ForceAborted) => {
                    return Err(Status::AbortConflict(
                        "transaction was force-aborted".to_string(),
                    ))
                }
                Some(_) => {
                    return Err(Status::OperationNotAllowed(
                        "transaction already ended".to_string(),
                    ))
                }
            }
        }

        // persist-before-install: the intent must be durable before it is
        // visible in the indexer or acknowledged
        if create_record {
            self.append(LogRecord::TxnTransition {
                txn_id: txn_id.clone(),
                state: TxnState::InProgress,
                write_keys: vec![],
            })
            .await?;
        }
        self.append(LogRecord::IntentAppend {
            key: request.key.clone(),
            timestamp: request.mtr.timestamp,
            owner: txn_id.clone(),
            value: image.clone(),
        })
        .await?;
        self.flush().await?;

        if create_record {
            if let Err(e) = self.txns.create_in_progress(txn_id.clone(), Instant::now()) {
                return Err(Status::Internal(e.to_string()));
            }
        }

        // a rewrite by the same transaction replaces its previous intent
        self.indexer.abort_intent(&request.key, &txn_id);
        if let Err(e) =
            self.indexer
                .install_intent(request.key, request.mtr.timestamp, txn_id.clone(), image)
        {
            return Err(self.indexer_fault(e));
        }
        self.txns.mark_intent(&txn_id);

        Ok(WriteResponse {})
    }

    /// Serves one page of a range query.
    pub async fn handle_query(
        &mut self,
        request: QueryRequest,
        deadline: Deadline,
    ) -> Result<QueryResponse, Status> {
        self.ensure_live(&deadline)?;
        self.validate_partition(&request.collection, request.pvid, None)?;
        self.validate_retention(&request.mtr)?;
        if !self.schemas.contains_key(&request.schema_name) {
            return Err(Status::OperationNotAllowed(format!(
                "schema {} does not exist",
                request.schema_name
            )));
        }

        let (floor, ceiling) = scan_bounds(&request);
        // coarse interval mark: the whole requested range counts as read
        self.read_cache
            .mark_interval(floor.clone(), ceiling.clone(), request.mtr.timestamp);

        let mut budget = PageBudget::new(
            self.config.scan_page_bytes,
            self.config.scan_page_rows,
            request.record_limit,
        );
        let mut records = Vec::new();
        let mut cursor: Option<Key> = None;

        loop {
            if deadline.is_past() {
                return Err(Status::RequestTimeout);
            }
            let exclusive = cursor.is_some() || request.exclusive_start;
            let Some(key) =
                self.next_scan_key(&floor, &ceiling, request.reverse, &cursor, exclusive)
            else {
                return Ok(QueryResponse {
                    records,
                    continuation: None,
                });
            };

            if !budget.has_room() {
                // the next key to visit becomes the continuation token
                return Ok(QueryResponse {
                    records,
                    continuation: Some(key),
                });
            }

            let mut attempts = 0;
            loop {
                match self.blocking_intent_for_read(&key, &request.mtr) {
                    BlockingIntent::Other(owner) => {
                        if attempts > self.config.push_retry_max {
                            return Err(Status::AbortConflict(
                                "push retries exhausted".to_string(),
                            ));
                        }
                        attempts += 1;
                        self.resolve_intent(&key, owner, &request.mtr, &deadline).await?;
                    }
                    // a scan does not return uncommitted data, not even the
                    // requester's own pending writes; the client merges those
                    _ => break,
                }
            }

            if let Some(version) = self
                .indexer
                .get_version_not_newer_than(&key, &request.mtr.timestamp)
            {
                if let Some(Some(record)) = version.committed_value() {
                    let row_schema =
                        self.schema_for(&record.schema_name, record.schema_version)?;
                    let keep = match &request.filter {
                        Some(filter) => eval_filter(filter, &row_schema, record)?,
                        None => true,
                    };
                    if keep {
                        let emitted = match &request.projection {
                            Some(projection) => record.project(&row_schema, projection),
                            None => record.clone(),
                        };
                        budget.charge(&emitted);
                        records.push(emitted);
                    }
                }
            }
            cursor = Some(key);
        }
    }

    /// Arbitrates a PUSH against a transaction whose TRH is this partition.
    pub async fn handle_txn_push(
        &mut self,
        request: TxnPushRequest,
        deadline: Deadline,
    ) -> Result<TxnPushResponse, Status> {
        self.ensure_live(&deadline)?;
        if !self.owns_trh(&request.incumbent) {
            return Err(Status::RefreshCollection(
                "not the record holder for pushed transaction".to_string(),
            ));
        }
        self.validate_retention(&request.challenger)?;

        let plan = self.txns.plan_push(&request.incumbent, &request.challenger);
        if plan.persist_force_abort {
            // the decision must be durable before it leaves this partition
            self.append(LogRecord::TxnTransition {
                txn_id: request.incumbent.clone(),
                state: TxnState::ForceAborted,
                write_keys: vec![],
            })
            .await?;
            self.flush().await?;
        }
        self.txns.apply_push(&request.incumbent, &plan, Instant::now());

        debug!(
            incumbent = %request.incumbent,
            challenger = %request.challenger,
            state = ?plan.decision.incumbent_state,
            allowed = plan.decision.allow_challenger,
            "push arbitrated"
        );
        Ok(TxnPushResponse {
            incumbent_state: plan.decision.incumbent_state,
            allow_challenger: plan.decision.allow_challenger,
        })
    }

    /// Ends a transaction at its TRH and drives finalize for its writes.
    pub async fn handle_txn_end(
        &mut self,
        request: TxnEndRequest,
        deadline: Deadline,
    ) -> Result<TxnEndResponse, Status> {
        self.ensure_live(&deadline)?;
        if !self.owns_trh(&request.txn_id) {
            return Err(Status::RefreshCollection(
                "not the record holder for ended transaction".to_string(),
            ));
        }

        let plan = match self.txns.plan_end(&request.txn_id, request.action) {
            Ok(plan) => plan,
            Err(TxnError::NotFound) => {
                // a transaction with no writes has no record here; ending it
                // is a no-op
                return Ok(TxnEndResponse {
                    state: match request.action {
                        EndAction::Commit => TxnState::Committed,
                        EndAction::Abort => TxnState::Aborted,
                    },
                });
            }
            Err(e) => return Err(Status::OperationNotAllowed(e.to_string())),
        };

        if plan.already_ended {
            return if plan.downgraded {
                Err(Status::AbortConflict(
                    "transaction was force-aborted".to_string(),
                ))
            } else {
                Ok(TxnEndResponse {
                    state: plan.new_state,
                })
            };
        }

        let write_keys: BTreeSet<(String, Key)> = request.write_keys.iter().cloned().collect();
        self.append(LogRecord::TxnTransition {
            txn_id: request.txn_id.clone(),
            state: plan.new_state,
            write_keys: request.write_keys.clone(),
        })
        .await?;
        self.flush().await?;
        self.txns.apply_end(&request.txn_id, plan.new_state, write_keys);

        // best-effort inline finalize; the background driver retries until
        // it converges
        if let Err(e) = self.drive_finalize(&request.txn_id, &deadline).await {
            warn!(txn = %request.txn_id, error = %e, "inline finalize incomplete; will retry");
        }

        if plan.downgraded {
            Err(Status::AbortConflict(
                "transaction was force-aborted".to_string(),
            ))
        } else {
            Ok(TxnEndResponse {
                state: plan.new_state,
            })
        }
    }

    /// Extends an in-progress transaction's expiry deadline.
    pub async fn handle_txn_heartbeat(
        &mut self,
        request: TxnHeartbeatRequest,
        deadline: Deadline,
    ) -> Result<TxnHeartbeatResponse, Status> {
        self.ensure_live(&deadline)?;
        if !self.owns_trh(&request.txn_id) {
            return Err(Status::RefreshCollection(
                "not the record holder for transaction".to_string(),
            ));
        }
        self.validate_retention(&request.txn_id.mtr)?;
        match self.txns.heartbeat(&request.txn_id, Instant::now()) {
            Ok(state) => Ok(TxnHeartbeatResponse { state }),
            Err(TxnError::NotFound) => Err(Status::KeyNotFound),
            Err(e) => Err(Status::Internal(e.to_string())),
        }
    }

    /// Applies a finalize for one key held on this partition. Idempotent.
    pub async fn handle_txn_finalize(
        &mut self,
        request: TxnFinalizeRequest,
        deadline: Deadline,
    ) -> Result<TxnFinalizeResponse, Status> {
        self.ensure_live(&deadline)?;
        if !self.meta.owns(&request.key) {
            return Err(Status::RefreshCollection(format!(
                "key {} not owned by this partition",
                request.key
            )));
        }
        self.apply_finalize_local(&request.txn_id, &request.key, request.action)
            .await?;
        Ok(TxnFinalizeResponse {})
    }

    /// Registers a schema version on this partition.
    pub async fn handle_push_schema(
        &mut self,
        request: PushSchemaRequest,
        deadline: Deadline,
    ) -> Result<PushSchemaResponse, Status> {
        self.ensure_live(&deadline)?;
        let schema = request.schema;
        if schema.name.is_empty() {
            return Err(Status::BadParameter("schema name is empty".to_string()));
        }
        info!(schema = %schema.name, version = schema.version, "schema registered");
        self.schemas
            .entry(schema.name.clone())
            .or_default()
            .insert(schema.version, Arc::new(schema));
        Ok(PushSchemaResponse {})
    }

    // ---- inspection verbs (read-only) ----

    pub fn inspect_records(&self, key: &Key) -> InspectRecordsResponse {
        InspectRecordsResponse {
            key: key.clone(),
            versions: self
                .indexer
                .versions(key)
                .map(|v| v.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn inspect_txn(&self, txn_id: &TxnId) -> Option<InspectTxnResponse> {
        self.txns.get(txn_id).map(|record| InspectTxnResponse {
            record: record.clone(),
        })
    }

    pub fn inspect_write_intents(&self) -> InspectWriteIntentsResponse {
        InspectWriteIntentsResponse {
            keys: self.indexer.keys_with_intents(),
        }
    }

    pub fn inspect_all_txns(&self) -> InspectAllTxnsResponse {
        InspectAllTxnsResponse {
            records: self.txns.inspect_all(),
        }
    }

    pub fn inspect_all_keys(&self) -> InspectAllKeysResponse {
        InspectAllKeysResponse {
            keys: self.indexer.all_keys(),
        }
    }

    // ---- cooperative background work ----

    /// Advances the retention horizon and garbage-collects behind it.
    pub async fn handle_retention_tick(&mut self) -> Result<(), Status> {
        let now = self
            .clock
            .now()
            .await
            .map_err(|e| Status::ServiceUnavailable(e.to_string()))?;
        let horizon = now.sub_window(self.config.retention_window);
        if horizon > self.retention_ts {
            self.retention_ts = horizon;
        }
        let trimmed = self.indexer.trim_older_than(&self.retention_ts);
        let swept = self.txns.retention_sweep(&self.retention_ts);
        if trimmed > 0 || swept > 0 {
            debug!(trimmed, swept, retention = %self.retention_ts, "retention advanced");
        }
        Ok(())
    }

    /// Force-aborts transactions that have missed their heartbeat deadline.
    pub async fn handle_expiry_tick(&mut self) -> Result<(), Status> {
        for txn_id in self.txns.expired(Instant::now()) {
            self.append(LogRecord::TxnTransition {
                txn_id: txn_id.clone(),
                state: TxnState::ForceAborted,
                write_keys: vec![],
            })
            .await?;
            self.flush().await?;
            self.txns.force_abort(&txn_id);
        }
        Ok(())
    }

    /// Transactions whose finalize has not yet converged.
    pub fn pending_finalizes(&self) -> Vec<TxnId> {
        self.txns
            .inspect_all()
            .into_iter()
            .filter(|r| matches!(r.state, TxnState::Committed | TxnState::Aborted))
            .map(|r| r.txn_id)
            .collect()
    }

    /// Sends finalize to every write key of a decided transaction and, once
    /// all are acknowledged, erases the record.
    ///
    /// Finalize must converge: the decision is already durable, applications
    /// are idempotent, and the caller retries on error with backoff.
    pub async fn drive_finalize(
        &mut self,
        txn_id: &TxnId,
        deadline: &Deadline,
    ) -> Result<(), Status> {
        let (action, keys) = match self.txns.get(txn_id) {
            Some(rec) if matches!(rec.state, TxnState::Committed | TxnState::Aborted) => (
                rec.finalize_action.unwrap_or(EndAction::Abort),
                rec.write_keys.clone(),
            ),
            _ => return Ok(()),
        };

        for (collection, key) in keys {
            if deadline.is_past() {
                return Err(Status::RequestTimeout);
            }
            if collection == self.meta.collection && self.meta.owns(&key) {
                self.apply_finalize_local(txn_id, &key, action).await?;
            } else {
                let target = self.locator.locate(&collection, &key).await?;
                self.transport
                    .finalize(
                        &target,
                        TxnFinalizeRequest {
                            txn_id: txn_id.clone(),
                            key: key.clone(),
                            action,
                        },
                    )
                    .await?;
            }
        }

        self.append(LogRecord::TxnTransition {
            txn_id: txn_id.clone(),
            state: TxnState::Deleted,
            write_keys: vec![],
        })
        .await?;
        self.flush().await?;
        self.txns.mark_finalized(txn_id);
        Ok(())
    }

    /// Writes a checkpoint of the current state, allowing log truncation.
    pub async fn checkpoint(&mut self) -> Result<(), Status> {
        let image = CheckpointImage {
            retention_ts: self.retention_ts,
            versions: self.indexer.snapshot(),
            txns: self
                .txns
                .inspect_all()
                .iter()
                .map(TxnImage::from)
                .collect(),
        };
        self.log
            .checkpoint(image)
            .await
            .map_err(Self::unavailable)?;
        Ok(())
    }

    // ---- internals ----

    fn ensure_live(&self, deadline: &Deadline) -> Result<(), Status> {
        if self.halted {
            return Err(Status::ServiceUnavailable(
                "partition halted on invariant violation".to_string(),
            ));
        }
        if deadline.is_past() {
            return Err(Status::RequestTimeout);
        }
        Ok(())
    }

    fn validate_partition(
        &self,
        collection: &str,
        pvid: u64,
        key: Option<&Key>,
    ) -> Result<(), Status> {
        if collection != self.meta.collection {
            return Err(Status::RefreshCollection(format!(
                "request for collection {collection} reached partition of {}",
                self.meta.collection
            )));
        }
        if pvid != self.meta.pvid {
            return Err(Status::Gone(format!(
                "partition version {pvid} superseded by {}",
                self.meta.pvid
            )));
        }
        if let Some(key) = key {
            if !self.meta.owns(key) {
                return Err(Status::RefreshCollection(format!(
                    "key {key} not owned by this partition"
                )));
            }
        }
        Ok(())
    }

    fn validate_retention(&self, mtr: &Mtr) -> Result<(), Status> {
        if mtr.timestamp.compare_certain(&self.retention_ts) == std::cmp::Ordering::Less {
            return Err(Status::AbortRequestTooOld(format!(
                "timestamp {} below retention horizon {}",
                mtr.timestamp, self.retention_ts
            )));
        }
        Ok(())
    }

    fn validate_read_request(
        &self,
        collection: &str,
        pvid: u64,
        key: &Key,
        mtr: &Mtr,
    ) -> Result<(), Status> {
        self.validate_partition(collection, pvid, Some(key))?;
        if !key.has_partition_key() {
            return Err(Status::BadParameter(
                "missing partition key in read request".to_string(),
            ));
        }
        self.validate_retention(mtr)?;
        if !self.schemas.contains_key(&key.schema_name) {
            return Err(Status::OperationNotAllowed(format!(
                "schema {} does not exist",
                key.schema_name
            )));
        }
        Ok(())
    }

    /// The stale-write rule: a write must land above every observed read
    /// and above the newest committed version of its key.
    fn validate_not_stale(&mut self, key: &Key, mtr: &Mtr) -> Result<(), Status> {
        let watermark = self.read_cache.check_key(key);
        if mtr.timestamp.compare_certain(&watermark) != std::cmp::Ordering::Greater {
            return Err(Status::AbortRequestTooOld(format!(
                "write at {} not above read watermark {}",
                mtr.timestamp, watermark
            )));
        }
        if let Some(newest) = self
            .indexer
            .versions(key)
            .and_then(|v| v.iter().find(|x| !x.is_intent()))
        {
            if mtr.timestamp.compare_certain(&newest.timestamp) != std::cmp::Ordering::Greater {
                return Err(Status::AbortRequestTooOld(format!(
                    "write at {} not above newest committed version {}",
                    mtr.timestamp, newest.timestamp
                )));
            }
        }
        Ok(())
    }

    fn schema_for(&self, name: &str, version: u32) -> Result<Arc<Schema>, Status> {
        self.schemas
            .get(name)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| {
                Status::OperationNotAllowed(format!("schema {name} version {version} does not exist"))
            })
    }

    fn owns_trh(&self, txn_id: &TxnId) -> bool {
        txn_id.collection == self.meta.collection && self.meta.owns(&txn_id.trh_key)
    }

    fn blocking_intent_for_read(&self, key: &Key, mtr: &Mtr) -> BlockingIntent {
        match self.indexer.intent(key) {
            Some(Version {
                timestamp,
                body: VersionBody::Intent { owner, value },
            }) if timestamp.compare_certain(&mtr.timestamp) != std::cmp::Ordering::Greater => {
                if owner.mtr == *mtr {
                    BlockingIntent::Own(value.clone())
                } else {
                    BlockingIntent::Other(owner.clone())
                }
            }
            _ => BlockingIntent::None,
        }
    }

    /// Pushes the incumbent at its TRH and resolves the local intent
    /// according to the decision.
    async fn resolve_intent(
        &mut self,
        key: &Key,
        incumbent: TxnId,
        challenger: &Mtr,
        deadline: &Deadline,
    ) -> Result<(), Status> {
        if deadline.is_past() {
            return Err(Status::RequestTimeout);
        }
        let response = if self.owns_trh(&incumbent) {
            self.handle_txn_push(
                TxnPushRequest {
                    collection: incumbent.collection.clone(),
                    incumbent: incumbent.clone(),
                    challenger: challenger.clone(),
                },
                *deadline,
            )
            .await?
        } else {
            let target = self
                .locator
                .locate(&incumbent.collection, &incumbent.trh_key)
                .await?;
            self.transport
                .push(
                    &target,
                    TxnPushRequest {
                        collection: incumbent.collection.clone(),
                        incumbent: incumbent.clone(),
                        challenger: challenger.clone(),
                    },
                )
                .await?
        };

        match response.incumbent_state {
            TxnState::Committed => {
                self.apply_finalize_local(&incumbent, key, EndAction::Commit)
                    .await
            }
            TxnState::Aborted | TxnState::ForceAborted | TxnState::Deleted => {
                self.apply_finalize_local(&incumbent, key, EndAction::Abort)
                    .await
            }
            TxnState::InProgress => Err(Status::AbortConflict(format!(
                "lost push against {incumbent}"
            ))),
        }
    }

    /// Converts or removes the local intent of `txn_id` on `key`. The
    /// resolution is persisted before the indexer changes. Idempotent.
    async fn apply_finalize_local(
        &mut self,
        txn_id: &TxnId,
        key: &Key,
        action: EndAction,
    ) -> Result<(), Status> {
        if self.indexer.intent(key).is_none() {
            // nothing to resolve; replayed finalize
            return Ok(());
        }
        let state = match action {
            EndAction::Commit => TxnState::Committed,
            EndAction::Abort => TxnState::Aborted,
        };
        self.append(LogRecord::TxnTransition {
            txn_id: txn_id.clone(),
            state,
            write_keys: vec![(self.meta.collection.clone(), key.clone())],
        })
        .await?;
        self.flush().await?;

        match action {
            EndAction::Commit => {
                match self
                    .indexer
                    .commit_intent(key, txn_id, txn_id.mtr.timestamp)
                {
                    Ok(_) => {}
                    Err(e) => return Err(self.indexer_fault(e)),
                }
            }
            EndAction::Abort => {
                self.indexer.abort_intent(key, txn_id);
            }
        }
        Ok(())
    }

    /// The next key a scan visits: ascending within `[floor, ceiling)` for
    /// forward scans, descending within `(floor, ceiling]` for reverse.
    fn next_scan_key(
        &self,
        floor: &Key,
        ceiling: &Key,
        reverse: bool,
        cursor: &Option<Key>,
        exclusive: bool,
    ) -> Option<Key> {
        use std::ops::Bound;
        if reverse {
            let from = cursor.as_ref().unwrap_or(ceiling);
            let hi = if exclusive {
                Bound::Excluded(from)
            } else {
                Bound::Included(from)
            };
            self.indexer
                .keys_between(Bound::Excluded(floor), hi)
                .next_back()
                .cloned()
        } else {
            let from = cursor.as_ref().unwrap_or(floor);
            let lo = if exclusive {
                Bound::Excluded(from)
            } else {
                Bound::Included(from)
            };
            self.indexer
                .keys_between(lo, Bound::Excluded(ceiling))
                .next()
                .cloned()
        }
    }

    fn make_write_image(
        &self,
        schema: &Schema,
        request: &WriteRequest,
    ) -> Result<Option<Record>, Status> {
        if request.is_delete {
            return Ok(None);
        }
        let Some(mask) = &request.field_mask else {
            return Ok(Some(request.value.clone()));
        };

        // partial update: reconcile the masked fields over the previous
        // record image
        let previous = self
            .previous_image(request)
            .ok_or(Status::KeyNotFound)?;

        let mut fields: Vec<Option<crate::schema::FieldValue>>;
        if previous.schema_name == request.value.schema_name
            && previous.schema_version == request.value.schema_version
        {
            // same schema, same version: overlay the masked fields
            fields = previous.fields.clone();
            for &i in mask {
                let i = i as usize;
                if i >= schema.fields.len() {
                    return Err(Status::BadParameter(format!(
                        "field mask index {i} out of range for schema {}",
                        schema.name
                    )));
                }
                fields[i] = request.value.fields.get(i).cloned().flatten();
            }
        } else {
            // different versions: carry unmasked fields over by name and type
            let base_schema =
                self.schema_for(&previous.schema_name, previous.schema_version)?;
            fields = vec![None; schema.fields.len()];
            for (i, field) in schema.fields.iter().enumerate() {
                if mask.contains(&(i as u32)) {
                    fields[i] = request.value.fields.get(i).cloned().flatten();
                } else if let Some(j) = base_schema.field_index(&field.name, field.field_type) {
                    fields[i] = previous.fields.get(j).cloned().flatten();
                }
            }
        }

        Ok(Some(Record {
            schema_name: request.value.schema_name.clone(),
            schema_version: request.value.schema_version,
            fields,
        }))
    }

    /// The record image a partial update starts from: the transaction's own
    /// pending intent if it has one, else the newest visible committed
    /// version.
    fn previous_image(&self, request: &WriteRequest) -> Option<Record> {
        if let Some(Version {
            body: VersionBody::Intent { owner, value },
            ..
        }) = self.indexer.intent(&request.key)
        {
            if owner.mtr == request.mtr {
                return value.clone();
            }
        }
        self.indexer
            .get_version_not_newer_than(&request.key, &request.mtr.timestamp)
            .and_then(|v| v.committed_value().cloned())
            .flatten()
    }

    async fn append(&mut self, record: LogRecord) -> Result<(), Status> {
        self.log.append(record).await.map_err(Self::unavailable)?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Status> {
        self.log.flush().await.map_err(Self::unavailable)?;
        Ok(())
    }

    fn unavailable(e: LogError) -> Status {
        Status::ServiceUnavailable(e.to_string())
    }

    fn indexer_fault(&mut self, e: IndexerError) -> Status {
        error!(error = %e, "indexer invariant violated; halting partition");
        self.halted = true;
        Status::Internal(e.to_string())
    }
}

enum BlockingIntent {
    /// The requester's own pending write.
    Own(Option<Record>),
    /// Another transaction's intent; PUSH is required.
    Other(TxnId),
    None,
}
