//! The document orchestrator.
//!
//! A [`Document`] binds schema fields to CRDTs and guards every change
//! behind signed ops:
//!
//! - Local mutations never touch the live fields. They run against a clone,
//!   capture the produced nodes, and spawn a signing task that broadcasts a
//!   [`DocumentEvent::Change`] once the token exists.
//! - Remote ops enter through [`Document::merge`], which checks the signer's
//!   role *at the op's stamp*, verifies the signature, and only then
//!   applies the op.
//!
//! Callers feed their own tokens back through `merge` (see
//! [`Document::flush_and_merge`]) to see their writes.

use crate::config::DocumentConfig;
use crate::error::DocError;
use crate::events::{DocumentEvent, EventBus, MergeEvent, RevokedEvent};
use crate::fields::{check_values, FieldCrdt, FieldValue};
use crate::handles::{
    AclHandle, ArrayHandle, FieldHandle, MapHandle, RecordHandle, RegisterHandle, SetHandle,
    TextHandle,
};
use chrono::Utc;
use quill_core::{
    nonce, AclAssignment, AclLog, CrdtKind, FieldSchema, Hlc, OpKind, Role, Schema, Timestamp,
};
use quill_proto::{
    decode_token, sign_token, verify_token, AckPatch, AclPatch, DocumentSnapshot, Jwk, OpPayload,
    RegisterPatch, RoleKeys, RolePublicKeys, SignError, SignedOp, TokenError, TokenHeader,
    TOKEN_TYP,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A schema field and its live CRDT.
#[derive(Debug, Clone)]
pub(crate) struct FieldState {
    pub(crate) schema: FieldSchema,
    pub(crate) crdt: FieldCrdt,
}

/// Result of [`Document::create`].
#[derive(Debug, Clone)]
pub struct CreateResult {
    /// Fresh document id
    pub doc_id: String,
    /// Id of the schema the document was created with
    pub schema_id: String,
    /// Generated role key pairs; hand private keys out per role
    pub role_keys: RoleKeys,
    /// Snapshot holding the owner grant and initial values
    pub snapshot: DocumentSnapshot,
}

/// Result of [`Document::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Ops applied (or already known), in application order
    pub accepted: Vec<SignedOp>,
    /// Number of ops rejected
    pub rejected: usize,
}

/// A replicated, access-controlled document.
#[derive(Debug)]
pub struct Document {
    doc_id: String,
    actor_id: String,
    schema_id: String,
    fields: BTreeMap<String, FieldState>,
    /// Schema-initial view served while revoked
    revoked_view: BTreeMap<String, FieldCrdt>,
    acl: AclLog,
    clock: Hlc,
    role_key: Option<Jwk>,
    role_keys: RolePublicKeys,
    op_log: Vec<SignedOp>,
    op_tokens: HashSet<String>,
    current_role: Role,
    acks: BTreeMap<String, Timestamp>,
    pending: Vec<JoinHandle<()>>,
    events: EventBus,
    emitted_tx: mpsc::UnboundedSender<SignedOp>,
    emitted_rx: mpsc::UnboundedReceiver<SignedOp>,
    /// Own signed tokens not yet merged
    unmerged: Vec<SignedOp>,
    config: DocumentConfig,
}

impl Document {
    /// Create a new document owned by `owner_id`.
    ///
    /// Generates role keys and signs the bootstrap owner grant followed by
    /// one op per field carrying its initial value. Nothing is live until
    /// the returned snapshot is loaded.
    ///
    /// # Errors
    ///
    /// Returns error if the schema is invalid or signing fails.
    pub async fn create(schema: &Schema, owner_id: &str) -> Result<CreateResult, DocError> {
        Self::create_with(schema, owner_id, DocumentConfig::default()).await
    }

    /// [`Document::create`] with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the schema is invalid or signing fails.
    pub async fn create_with(
        schema: &Schema,
        owner_id: &str,
        config: DocumentConfig,
    ) -> Result<CreateResult, DocError> {
        schema.validate()?;

        let signer = config.signer.as_ref();
        let role_keys = RoleKeys::generate(signer).map_err(TokenError::from)?;
        let owner_key = role_keys
            .private_for(Role::Owner)
            .ok_or(TokenError::Sign(SignError::NoKeyForRole(Role::Owner)))?;

        let doc_id = nonce();
        let schema_id = schema.id();
        let mut clock = Hlc::new(owner_id);
        let op = |kind: OpKind, stamp: Timestamp, field: Option<String>, patch: Value| OpPayload {
            iss: owner_id.to_string(),
            sub: doc_id.clone(),
            iat: Utc::now().timestamp(),
            stamp,
            kind,
            schema: schema_id.clone(),
            field,
            patch,
        };

        let grant = AclPatch {
            id: config.ids.next_id(),
            target: owner_id.to_string(),
            role: Role::Owner,
        };
        let mut payloads = vec![op(
            OpKind::AclSet,
            clock.tick(),
            None,
            serde_json::to_value(grant)?,
        )];

        for (name, field) in schema.fields() {
            let patch = match (&field.crdt, &field.initial) {
                (CrdtKind::Register, Some(value)) => Some(serde_json::to_value(RegisterPatch {
                    value: value.clone(),
                })?),
                (CrdtKind::Register, None) => None,
                _ => FieldCrdt::seeded(field, &config.ids).take_patch()?,
            };
            if let Some(patch) = patch {
                payloads.push(op(field.crdt.op_kind(), clock.tick(), Some(name.clone()), patch));
            }
        }

        let header = TokenHeader {
            alg: signer.algorithm().to_string(),
            typ: TOKEN_TYP.to_string(),
            kid: Some(format!("{owner_id}:{}", Role::Owner)),
        };
        let mut ops = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            ops.push(SignedOp::from(sign_token(signer, owner_key, &header, payload).await?));
        }

        info!(doc_id = %doc_id, owner = %owner_id, ops = ops.len(), "Created document");

        let snapshot = DocumentSnapshot {
            doc_id: doc_id.clone(),
            role_keys: role_keys.public(),
            ops,
        };
        Ok(CreateResult {
            doc_id,
            schema_id,
            role_keys,
            snapshot,
        })
    }

    /// Open a replica by replaying `snapshot`.
    ///
    /// `role_key` is the private key of the role the actor signs with; a
    /// replica without one can read and merge but not write.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::InvalidSnapshot`] if any op is rejected, or a
    /// validation error for an invalid schema.
    pub async fn load(
        schema: Schema,
        actor_id: impl Into<String>,
        role_key: Option<Jwk>,
        snapshot: DocumentSnapshot,
    ) -> Result<Self, DocError> {
        Self::load_with(schema, actor_id, role_key, snapshot, DocumentConfig::default()).await
    }

    /// [`Document::load`] with explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::InvalidSnapshot`] if any op is rejected, or a
    /// validation error for an invalid schema.
    pub async fn load_with(
        schema: Schema,
        actor_id: impl Into<String>,
        role_key: Option<Jwk>,
        snapshot: DocumentSnapshot,
        config: DocumentConfig,
    ) -> Result<Self, DocError> {
        schema.validate()?;
        let actor_id = actor_id.into();

        let fields = schema
            .fields()
            .map(|(name, field)| {
                let state = FieldState {
                    schema: field.clone(),
                    crdt: FieldCrdt::empty(field.crdt, &config.ids),
                };
                (name.clone(), state)
            })
            .collect();
        let revoked_view = schema
            .fields()
            .map(|(name, field)| (name.clone(), FieldCrdt::seeded(field, &config.ids)))
            .collect();
        let (emitted_tx, emitted_rx) = mpsc::unbounded_channel();

        let mut doc = Self {
            doc_id: snapshot.doc_id,
            clock: Hlc::new(actor_id.clone()),
            actor_id,
            schema_id: schema.id(),
            fields,
            revoked_view,
            acl: AclLog::new(),
            role_key,
            role_keys: snapshot.role_keys,
            op_log: Vec::new(),
            op_tokens: HashSet::new(),
            current_role: Role::Revoked,
            acks: BTreeMap::new(),
            pending: Vec::new(),
            events: EventBus::new(config.event_capacity),
            emitted_tx,
            emitted_rx,
            unmerged: Vec::new(),
            config,
        };

        let outcome = doc.merge(&snapshot.ops).await;
        if outcome.rejected > 0 {
            return Err(DocError::InvalidSnapshot {
                rejected: outcome.rejected,
            });
        }

        info!(
            doc_id = %doc.doc_id,
            actor = %doc.actor_id,
            role = %doc.current_role,
            ops = doc.op_log.len(),
            "Loaded document"
        );
        Ok(doc)
    }

    /// Document id.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Local actor id.
    #[must_use]
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Schema id ops must carry.
    #[must_use]
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    /// Current role of the local actor.
    #[must_use]
    pub fn role(&self) -> Role {
        self.current_role
    }

    /// Whether the local actor has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.current_role == Role::Revoked
    }

    /// Accepted ops in acceptance order.
    #[must_use]
    pub fn op_log(&self) -> &[SignedOp] {
        &self.op_log
    }

    /// Latest acknowledged clock per actor.
    #[must_use]
    pub fn acks(&self) -> &BTreeMap<String, Timestamp> {
        &self.acks
    }

    /// Subscribe to document events.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    /// Replayable snapshot of the document.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] while revoked.
    pub fn snapshot(&self) -> Result<DocumentSnapshot, DocError> {
        if self.is_revoked() {
            return Err(DocError::Unauthorized {
                role: self.current_role,
                action: "take a snapshot".to_string(),
            });
        }
        Ok(DocumentSnapshot {
            doc_id: self.doc_id.clone(),
            role_keys: self.role_keys.clone(),
            ops: self.op_log.clone(),
        })
    }

    /// Read view of one field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields.
    pub fn value(&self, name: &str) -> Result<FieldValue, DocError> {
        self.read(name)
            .map(FieldCrdt::value)
            .ok_or_else(|| unknown_field(name))
    }

    /// Read view of every field.
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, FieldValue> {
        self.fields
            .keys()
            .filter_map(|name| self.read(name).map(|crdt| (name.clone(), crdt.value())))
            .collect()
    }

    /// Typed handle for a field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields.
    pub fn field(&mut self, name: &str) -> Result<FieldHandle<'_>, DocError> {
        let kind = self.kind_of(name)?;
        let name = name.to_string();
        Ok(match kind {
            CrdtKind::Register => FieldHandle::Register(RegisterHandle::new(self, name)),
            CrdtKind::Text => FieldHandle::Text(TextHandle::new(self, name)),
            CrdtKind::Array => FieldHandle::Array(ArrayHandle::new(self, name)),
            CrdtKind::Set => FieldHandle::Set(SetHandle::new(self, name)),
            CrdtKind::Map => FieldHandle::Map(MapHandle::new(self, name)),
            CrdtKind::Record => FieldHandle::Record(RecordHandle::new(self, name)),
        })
    }

    /// Handle for a register field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields or a different kind.
    pub fn register(&mut self, name: &str) -> Result<RegisterHandle<'_>, DocError> {
        self.expect_kind(name, CrdtKind::Register)?;
        Ok(RegisterHandle::new(self, name.to_string()))
    }

    /// Handle for a text field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields or a different kind.
    pub fn text(&mut self, name: &str) -> Result<TextHandle<'_>, DocError> {
        self.expect_kind(name, CrdtKind::Text)?;
        Ok(TextHandle::new(self, name.to_string()))
    }

    /// Handle for an array field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields or a different kind.
    pub fn array(&mut self, name: &str) -> Result<ArrayHandle<'_>, DocError> {
        self.expect_kind(name, CrdtKind::Array)?;
        Ok(ArrayHandle::new(self, name.to_string()))
    }

    /// Handle for a set field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields or a different kind.
    pub fn set(&mut self, name: &str) -> Result<SetHandle<'_>, DocError> {
        self.expect_kind(name, CrdtKind::Set)?;
        Ok(SetHandle::new(self, name.to_string()))
    }

    /// Handle for a map field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields or a different kind.
    pub fn map(&mut self, name: &str) -> Result<MapHandle<'_>, DocError> {
        self.expect_kind(name, CrdtKind::Map)?;
        Ok(MapHandle::new(self, name.to_string()))
    }

    /// Handle for a record field.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown fields or a different kind.
    pub fn record(&mut self, name: &str) -> Result<RecordHandle<'_>, DocError> {
        self.expect_kind(name, CrdtKind::Record)?;
        Ok(RecordHandle::new(self, name.to_string()))
    }

    /// Handle for the access-control log.
    pub fn acl(&mut self) -> AclHandle<'_> {
        AclHandle::new(self)
    }

    /// Sign an `ack` op carrying the local clock.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Unauthorized`] if the local role cannot sign,
    /// or [`DocError::NoRuntime`] outside a tokio runtime.
    pub fn ack(&mut self) -> Result<(), DocError> {
        let stamp = self.clock.tick();
        let role = self.acl.role_at(&self.actor_id, &stamp);
        let patch = serde_json::to_value(AckPatch {
            seen: stamp.clone(),
        })?;
        self.dispatch(stamp, role, OpKind::Ack, None, patch)
    }

    /// Wait for the signing tasks pending at call time.
    ///
    /// Tokens signed so far are left to the caller, who received them as
    /// [`DocumentEvent::Change`]; a later [`Document::flush_and_merge`]
    /// no longer merges them.
    pub async fn flush(&mut self) {
        self.await_pending().await;
        self.collect_emitted();
        self.unmerged.clear();
    }

    /// Wait for pending signing, then merge every own token not merged
    /// since the last flush.
    pub async fn flush_and_merge(&mut self) -> MergeOutcome {
        self.await_pending().await;
        self.collect_emitted();
        let ops = std::mem::take(&mut self.unmerged);
        self.merge(&ops).await
    }

    /// Own signed tokens that neither a merge nor a flush has consumed.
    #[must_use]
    pub fn unmerged_len(&self) -> usize {
        self.unmerged.len()
    }

    async fn await_pending(&mut self) {
        for task in std::mem::take(&mut self.pending) {
            if let Err(e) = task.await {
                warn!(error = %e, "Signing task failed to complete");
            }
        }
    }

    fn collect_emitted(&mut self) {
        while let Ok(op) = self.emitted_rx.try_recv() {
            self.unmerged.push(op);
        }
    }

    /// Merge a batch of signed ops.
    ///
    /// Ops are applied in (stamp, token) order. Each op is checked on its
    /// own; an invalid op is counted as rejected and never aborts the
    /// batch. Ops already in the log count as accepted.
    pub async fn merge(&mut self, ops: &[SignedOp]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let mut batch = Vec::with_capacity(ops.len());
        for op in ops {
            match decode_token(&op.token) {
                Ok(decoded) if decoded.payload.sub != self.doc_id => {
                    debug!(iss = %decoded.payload.iss, "Rejected op for another document");
                    outcome.rejected += 1;
                }
                Ok(decoded) if decoded.payload.schema != self.schema_id => {
                    debug!(iss = %decoded.payload.iss, "Rejected op for another schema");
                    outcome.rejected += 1;
                }
                Ok(decoded) => batch.push((decoded.payload, op)),
                Err(e) => {
                    debug!(error = %e, "Rejected malformed token");
                    outcome.rejected += 1;
                }
            }
        }
        batch.sort_by(|(a, x), (b, y)| a.stamp.cmp(&b.stamp).then_with(|| x.token.cmp(&y.token)));

        for (payload, op) in batch {
            if self.op_tokens.contains(&op.token) {
                outcome.accepted.push(op.clone());
                continue;
            }
            match self.apply(&payload, &op.token).await {
                Ok(()) => {
                    self.op_tokens.insert(op.token.clone());
                    self.op_log.push(op.clone());
                    outcome.accepted.push(op.clone());
                }
                Err(reason) => {
                    debug!(
                        iss = %payload.iss,
                        kind = %payload.kind,
                        stamp = ?payload.stamp,
                        reason = %reason,
                        "Rejected op"
                    );
                    outcome.rejected += 1;
                }
            }
        }

        self.collect_emitted();
        if !self.unmerged.is_empty() {
            let known = &self.op_tokens;
            self.unmerged.retain(|op| !known.contains(&op.token));
        }
        outcome
    }

    async fn apply(&mut self, payload: &OpPayload, token: &str) -> Result<(), String> {
        let signer_role = self.signer_role(payload)?;
        let key = self
            .role_keys
            .for_role(signer_role)
            .ok_or_else(|| format!("no verification key for role {signer_role}"))?;
        verify_token(self.config.signer.as_ref(), key, token)
            .await
            .map_err(|e| e.to_string())?;

        let is_field_op = !matches!(payload.kind, OpKind::AclSet | OpKind::Ack);
        if is_field_op && !signer_role.can_write_fields() {
            return Err(format!("role {signer_role} cannot write fields"));
        }

        match payload.kind {
            OpKind::AclSet => self.apply_grant(payload, signer_role),
            OpKind::Ack => self.apply_ack(payload),
            _ => self.apply_field(payload),
        }?;
        self.clock.observe(&payload.stamp);
        Ok(())
    }

    /// Role the issuer held at the op's stamp.
    ///
    /// While the log is empty, a grant of `owner` to its own issuer counts
    /// as signed by an owner.
    fn signer_role(&self, payload: &OpPayload) -> Result<Role, String> {
        if payload.kind == OpKind::AclSet && self.acl.is_empty() {
            if let Ok(patch) = payload.patch_as::<AclPatch>() {
                if patch.target == payload.iss && patch.role == Role::Owner {
                    return Ok(Role::Owner);
                }
            }
        }
        let role = self.acl.role_at(&payload.iss, &payload.stamp);
        if role.signs() {
            Ok(role)
        } else {
            Err(format!("signer role {role} cannot sign"))
        }
    }

    fn apply_grant(&mut self, payload: &OpPayload, signer_role: Role) -> Result<(), String> {
        let patch: AclPatch = payload.patch_as().map_err(|e| e.to_string())?;
        if !signer_role.can_grant(patch.role) {
            return Err(format!("role {signer_role} cannot grant {}", patch.role));
        }

        let assignment = AclAssignment {
            id: patch.id,
            actor_id: patch.target,
            role: patch.role,
            stamp: payload.stamp.clone(),
            by: payload.iss.clone(),
        };
        if let Some(known) = self.acl.get(&assignment.id) {
            return if *known == assignment {
                Ok(())
            } else {
                Err(format!("grant id {} already used", assignment.id))
            };
        }
        debug!(
            actor = %assignment.actor_id,
            role = %assignment.role,
            by = %assignment.by,
            "Merged grant"
        );
        self.acl.merge([assignment.clone()]);
        self.refresh_role(&assignment);
        Ok(())
    }

    /// Recompute the local role after `grant`, announcing revocation.
    fn refresh_role(&mut self, grant: &AclAssignment) {
        let role = self.acl.current_role(&self.actor_id);
        if role == self.current_role {
            return;
        }
        let previous = std::mem::replace(&mut self.current_role, role);

        if role == Role::Revoked {
            info!(actor = %self.actor_id, previous = %previous, by = %grant.by, "Access revoked");
            self.events.emit(DocumentEvent::Revoked(RevokedEvent {
                actor_id: self.actor_id.clone(),
                previous,
                by: grant.by.clone(),
                stamp: grant.stamp.clone(),
            }));
        } else {
            debug!(actor = %self.actor_id, previous = %previous, role = %role, "Role changed");
        }
    }

    fn apply_ack(&mut self, payload: &OpPayload) -> Result<(), String> {
        let patch: AckPatch = payload.patch_as().map_err(|e| e.to_string())?;
        let seen = self
            .acks
            .entry(payload.iss.clone())
            .or_insert_with(|| patch.seen.clone());
        if patch.seen > *seen {
            *seen = patch.seen;
        }
        Ok(())
    }

    fn apply_field(&mut self, payload: &OpPayload) -> Result<(), String> {
        let name = payload
            .field
            .as_deref()
            .ok_or_else(|| "field op without a field".to_string())?;
        let revoked = self.is_revoked();
        let state = self
            .fields
            .get_mut(name)
            .ok_or_else(|| format!("unknown field '{name}'"))?;
        let changes = state.crdt.merge_remote(&state.schema, payload)?;

        if revoked {
            return Ok(());
        }
        for change in changes {
            self.events.emit(DocumentEvent::Merge(MergeEvent {
                actor: payload.iss.clone(),
                target: name.to_string(),
                method: change.method,
                data: change.data,
            }));
        }
        Ok(())
    }

    /// CRDT that reads are served from: the live field, or the schema
    /// initial while revoked.
    pub(crate) fn read(&self, name: &str) -> Option<&FieldCrdt> {
        if self.is_revoked() {
            self.revoked_view.get(name)
        } else {
            self.fields.get(name).map(|state| &state.crdt)
        }
    }

    pub(crate) fn kind_of(&self, name: &str) -> Result<CrdtKind, DocError> {
        self.fields
            .get(name)
            .map(|state| state.schema.crdt)
            .ok_or_else(|| unknown_field(name))
    }

    fn expect_kind(&self, name: &str, kind: CrdtKind) -> Result<(), DocError> {
        let actual = self.kind_of(name)?;
        if actual == kind {
            Ok(())
        } else {
            Err(DocError::Validation(format!(
                "field '{name}' is a {actual}, not a {kind}"
            )))
        }
    }

    /// Shadow-commit a collection mutation.
    ///
    /// `values` are type-checked before anything is stamped. `mutate` runs
    /// against a clone of the live CRDT; its journal becomes the op patch.
    pub(crate) fn commit_field<R>(
        &mut self,
        name: &str,
        kind: CrdtKind,
        values: &[&Value],
        mutate: impl FnOnce(&mut FieldCrdt) -> Result<R, DocError>,
    ) -> Result<R, DocError> {
        self.expect_kind(name, kind)?;
        let state = self.fields.get(name).ok_or_else(|| unknown_field(name))?;
        check_values(name, &state.schema, values.iter().copied())?;
        let mut shadow = state.crdt.clone();

        let stamp = self.clock.tick();
        let role = self.acl.role_at(&self.actor_id, &stamp);
        if !role.can_write_fields() {
            return Err(DocError::Unauthorized {
                role,
                action: format!("write field '{name}'"),
            });
        }

        let result = mutate(&mut shadow)?;
        let Some(patch) = shadow.take_patch()? else {
            return Ok(result);
        };
        self.dispatch(stamp, role, kind.op_kind(), Some(name.to_string()), patch)?;
        Ok(result)
    }

    /// Sign a register write.
    pub(crate) fn commit_register(&mut self, name: &str, value: Value) -> Result<(), DocError> {
        self.expect_kind(name, CrdtKind::Register)?;
        let state = self.fields.get(name).ok_or_else(|| unknown_field(name))?;
        if !state.schema.accepts(&value) {
            return Err(DocError::Validation(format!(
                "value rejected by field '{name}'"
            )));
        }

        let stamp = self.clock.tick();
        let role = self.acl.role_at(&self.actor_id, &stamp);
        if !role.can_write_fields() {
            return Err(DocError::Unauthorized {
                role,
                action: format!("write field '{name}'"),
            });
        }

        let patch = serde_json::to_value(RegisterPatch { value })?;
        self.dispatch(stamp, role, OpKind::RegisterSet, Some(name.to_string()), patch)
    }

    /// Sign a grant of `role` to `actor_id`.
    pub(crate) fn commit_grant(&mut self, actor_id: &str, role: Role) -> Result<(), DocError> {
        let stamp = self.clock.tick();
        let signer_role = self.acl.role_at(&self.actor_id, &stamp);
        if !signer_role.can_grant(role) {
            return Err(DocError::Unauthorized {
                role: signer_role,
                action: format!("grant {role}"),
            });
        }

        let patch = serde_json::to_value(AclPatch {
            id: self.config.ids.next_id(),
            target: actor_id.to_string(),
            role,
        })?;
        self.dispatch(stamp, signer_role, OpKind::AclSet, None, patch)
    }

    pub(crate) fn acl_log(&self) -> &AclLog {
        &self.acl
    }

    /// Spawn the signing task for a local op.
    fn dispatch(
        &mut self,
        stamp: Timestamp,
        role: Role,
        kind: OpKind,
        field: Option<String>,
        patch: Value,
    ) -> Result<(), DocError> {
        if !role.signs() {
            return Err(DocError::Unauthorized {
                role,
                action: "sign ops".to_string(),
            });
        }
        let key = self.role_key.clone().ok_or_else(|| DocError::Unauthorized {
            role,
            action: "sign ops without a role key".to_string(),
        })?;
        let runtime = Handle::try_current().map_err(|_| DocError::NoRuntime)?;

        let signer = Arc::clone(&self.config.signer);
        let header = TokenHeader {
            alg: signer.algorithm().to_string(),
            typ: TOKEN_TYP.to_string(),
            kid: Some(format!("{}:{role}", self.actor_id)),
        };
        let payload = OpPayload {
            iss: self.actor_id.clone(),
            sub: self.doc_id.clone(),
            iat: Utc::now().timestamp(),
            stamp,
            kind,
            schema: self.schema_id.clone(),
            field,
            patch,
        };
        debug!(kind = %kind, field = ?payload.field, stamp = ?payload.stamp, "Queued local op");

        let events = self.events.clone();
        let emitted = self.emitted_tx.clone();
        self.pending.retain(|task| !task.is_finished());
        let task = runtime.spawn(async move {
            match sign_token(signer.as_ref(), &key, &header, &payload).await {
                Ok(token) => {
                    let op = SignedOp::from(token);
                    // The receiver lives as long as the document
                    let _ = emitted.send(op.clone());
                    events.emit(DocumentEvent::Change { ops: vec![op] });
                }
                Err(e) => {
                    warn!(error = %e, kind = %payload.kind, "Failed to sign local op");
                    events.emit(DocumentEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        });
        self.pending.push(task);
        Ok(())
    }
}

fn unknown_field(name: &str) -> DocError {
    DocError::Validation(format!("unknown field '{name}'"))
}
