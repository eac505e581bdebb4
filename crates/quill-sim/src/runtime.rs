//! Simulation runtime.
//!
//! The owner and every editor run as separate tasks, each owning its own
//! replica. On every tick an actor mutates the shared fields, merges its own
//! tokens, and relays them to the others. Incoming tokens are merged as they
//! arrive. Once every actor is done, the honest replicas exchange their full
//! logs and must end up identical.

use crate::config::SimConfig;
use crate::relay::{tamper, Relay};
use anyhow::{Context, Result};
use quill_core::{FieldSchema, Role, Schema, ValueType};
use quill_doc::{Document, FieldValue, MergeOutcome};
use quill_proto::SignedOp;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Fields compared at the end of a run.
pub const CHECKED_FIELDS: [&str; 3] = ["title", "body", "items"];

const OWNER: &str = "owner";
const ADVERSARY: &str = "mallory";
const TAMPER_RATE: f64 = 0.4;

/// Schema shared by every replica.
#[must_use]
pub fn schema() -> Schema {
    Schema::new()
        .with_field(
            "title",
            FieldSchema::register()
                .with_type(ValueType::String)
                .with_initial(json!("Untitled")),
        )
        .with_field("body", FieldSchema::text())
        .with_field("items", FieldSchema::array(ValueType::Number))
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Honest actors, owner included
    pub honest: Vec<String>,
    /// Ops accepted across honest replicas
    pub accepted: usize,
    /// Ops rejected across honest replicas
    pub rejected: usize,
    /// Local escalation attempts refused
    pub refused_escalations: usize,
    /// Whether all honest replicas agree on the checked fields
    pub converged: bool,
    /// Checked fields as seen by the owner
    pub values: BTreeMap<String, FieldValue>,
}

struct Actor {
    id: String,
    doc: Document,
    inbox: mpsc::UnboundedReceiver<SignedOp>,
    adversarial: bool,
    accepted: usize,
    rejected: usize,
    refused: usize,
}

impl Actor {
    fn record(&mut self, outcome: &MergeOutcome) {
        self.accepted += outcome.accepted.len();
        self.rejected += outcome.rejected;
    }
}

/// A configured simulation.
#[derive(Debug)]
pub struct Simulation {
    config: SimConfig,
}

impl Simulation {
    /// Create a simulation.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the simulation to completion.
    ///
    /// # Errors
    ///
    /// Returns error if document setup fails or an actor task fails.
    pub async fn run(self) -> Result<SimReport> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut peers = vec![OWNER.to_string()];
        peers.extend((1..=self.config.actors).map(|n| format!("editor-{n}")));
        if self.config.adversarial {
            peers.push(ADVERSARY.to_string());
        }

        let created = Document::create(&schema(), OWNER)
            .await
            .context("Failed to create document")?;
        let owner_key = created.role_keys.private_for(Role::Owner).cloned();
        let editor_key = created.role_keys.private_for(Role::Editor).cloned();

        let mut owner = Document::load(schema(), OWNER, owner_key, created.snapshot.clone())
            .await
            .context("Failed to load owner replica")?;
        for peer in peers.iter().filter(|p| *p != OWNER) {
            owner.acl().set_role(peer, Role::Editor)?;
        }
        owner.flush_and_merge().await;
        let snapshot = owner.snapshot()?;

        info!(
            doc_id = %created.doc_id,
            actors = peers.len(),
            steps = self.config.steps,
            adversarial = self.config.adversarial,
            "Starting simulation"
        );

        let (relay, inboxes) = Relay::new(&peers, self.config.delay_min, self.config.delay_max);
        let mut owner = Some(owner);
        let mut tasks = Vec::with_capacity(peers.len());
        for (id, inbox) in peers.iter().zip(inboxes) {
            let doc = match owner.take().filter(|_| id == OWNER) {
                Some(doc) => doc,
                None => Document::load(schema(), id.clone(), editor_key.clone(), snapshot.clone())
                    .await
                    .with_context(|| format!("Failed to load replica for {id}"))?,
            };
            let actor = Actor {
                id: id.clone(),
                doc,
                inbox,
                adversarial: id == ADVERSARY,
                accepted: 0,
                rejected: 0,
                refused: 0,
            };
            let rng = StdRng::seed_from_u64(rng.gen());
            tasks.push(tokio::spawn(run_actor(
                actor,
                relay.clone(),
                self.config.clone(),
                rng,
            )));
        }

        let mut actors = Vec::with_capacity(tasks.len());
        for task in tasks {
            actors.push(task.await.context("Actor task panicked")??);
        }

        barrier(&mut actors).await;
        Ok(report(&actors))
    }
}

async fn run_actor(
    mut actor: Actor,
    relay: Relay,
    config: SimConfig,
    mut rng: StdRng,
) -> Result<Actor> {
    let mut ticker = tokio::time::interval(config.tick);
    let mut remaining = config.steps;

    if actor.adversarial {
        match actor.doc.acl().set_role(&actor.id, Role::Manager) {
            Ok(()) => warn!(actor = %actor.id, "Escalation unexpectedly signed"),
            Err(e) => {
                debug!(actor = %actor.id, error = %e, "Escalation refused");
                actor.refused += 1;
            }
        }
    }

    while remaining > 0 {
        tokio::select! {
            Some(op) = actor.inbox.recv() => {
                let outcome = actor.doc.merge(&[op]).await;
                actor.record(&outcome);
            }
            _ = ticker.tick() => {
                remaining -= 1;
                mutate(&mut actor.doc, &actor.id, &mut rng)?;

                let outcome = actor.doc.flush_and_merge().await;
                actor.record(&outcome);

                let mut outgoing = outcome.accepted;
                if actor.adversarial {
                    for op in &mut outgoing {
                        if rng.gen_bool(TAMPER_RATE) {
                            *op = tamper(op, &mut rng);
                        }
                    }
                }
                relay.send(&actor.id, &outgoing, &mut rng);
            }
        }
    }

    debug!(actor = %actor.id, accepted = actor.accepted, rejected = actor.rejected, "Actor finished");
    Ok(actor)
}

/// One random mutation of the checked fields.
fn mutate(doc: &mut Document, id: &str, rng: &mut StdRng) -> Result<()> {
    match rng.gen_range(0..5) {
        0 => {
            let mut items = doc.array("items")?;
            items.push(json!(rng.gen_range(0..100)))?;
        }
        1 => {
            doc.array("items")?.shift()?;
        }
        2 => {
            let mut items = doc.array("items")?;
            if !items.is_empty() {
                let index = rng.gen_range(0..items.len());
                items.set_at(index, json!(rng.gen_range(100..200)))?;
            }
        }
        3 => {
            let stamp: u32 = rng.gen();
            doc.register("title")?.set(json!(format!("{id} {stamp}")))?;
        }
        _ => {
            let mut body = doc.text("body")?;
            let index = rng.gen_range(0..=body.len());
            let ch = char::from(rng.gen_range(b'a'..=b'z'));
            body.insert_at(index, &ch.to_string())?;
        }
    }
    Ok(())
}

/// Full flush-and-merge barrier across the honest replicas.
async fn barrier(actors: &mut [Actor]) {
    let mut union: Vec<SignedOp> = Vec::new();
    for actor in actors.iter_mut().filter(|a| !a.adversarial) {
        let outcome = actor.doc.flush_and_merge().await;
        actor.record(&outcome);
        union.extend(actor.doc.op_log().iter().cloned());
    }
    for actor in actors.iter_mut().filter(|a| !a.adversarial) {
        let outcome = actor.doc.merge(&union).await;
        actor.record(&outcome);
    }
}

fn checked_values(doc: &Document) -> BTreeMap<String, FieldValue> {
    CHECKED_FIELDS
        .iter()
        .filter_map(|name| doc.value(name).ok().map(|v| ((*name).to_string(), v)))
        .collect()
}

fn report(actors: &[Actor]) -> SimReport {
    let honest: Vec<&Actor> = actors.iter().filter(|a| !a.adversarial).collect();
    let values = honest
        .first()
        .map(|a| checked_values(&a.doc))
        .unwrap_or_default();
    let converged = honest.iter().all(|a| checked_values(&a.doc) == values);

    if converged {
        info!(actors = honest.len(), "Honest replicas converged");
    } else {
        warn!(actors = honest.len(), "Honest replicas diverged");
    }

    SimReport {
        honest: honest.iter().map(|a| a.id.clone()).collect(),
        accepted: honest.iter().map(|a| a.accepted).sum(),
        rejected: honest.iter().map(|a| a.rejected).sum(),
        refused_escalations: actors.iter().map(|a| a.refused).sum(),
        converged,
        values,
    }
}
