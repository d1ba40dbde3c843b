//! # Record Store
//!
//! The consultation assistant only ever reads three things from the booking
//! system: who is signed in, which pets they own, and which doctors can be
//! booked. `RecordStore` is that boundary. A session's tool dispatcher holds
//! an actor-scoped store and never sees another owner's data.
//!
//! `InMemoryRecords` is the process-wide implementation used by the server.
//! It is loaded once from a TOML seed file:
//!
//! ```toml
//! [[users]]
//! id = "user-1"
//! name = "Dana Whitfield"
//!
//! [[pets]]
//! id = "pet-1"
//! owner_id = "user-1"
//! name = "Max"
//! species = "dog"
//!
//! [[doctors]]
//! id = "doc-1"
//! name = "Dr. Amelia Smith"
//! specialization = "General Practice"
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Doctor searches never return more than this many rows.
pub const MAX_DOCTOR_RESULTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pet {
    pub id: String,
    #[serde(alias = "owner_id")]
    pub owner_id: String,
    pub name: String,
    pub species: String,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Doctor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub specialization: Option<String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("no authenticated user")]
    Unauthenticated,

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the booking system, scoped to the current actor.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Pets owned by the signed-in actor. Fails when nobody is signed in.
    async fn list_pets_for_current_actor(&self) -> Result<Vec<Pet>, RecordError>;

    /// The signed-in actor, or `None` for an anonymous visitor.
    async fn current_actor(&self) -> Result<Option<Actor>, RecordError>;

    /// Available doctors ordered by name, at most [`MAX_DOCTOR_RESULTS`].
    /// An empty query matches everyone; otherwise the query is matched as a
    /// case-insensitive substring of the doctor's name.
    async fn search_available_doctors(&self, query: &str) -> Result<Vec<Doctor>, RecordError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RecordSeed {
    #[serde(default)]
    pub users: Vec<Actor>,
    #[serde(default)]
    pub pets: Vec<Pet>,
    #[serde(default)]
    pub doctors: Vec<Doctor>,
}

/// Process-wide read-only records shared by every session.
///
/// The default value has no seed loaded; every lookup through it fails with
/// [`RecordError::Unavailable`] so the assistant can say so instead of
/// reporting an empty practice.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecords {
    seed: Option<Arc<RecordSeed>>,
}

impl InMemoryRecords {
    pub fn new(seed: RecordSeed) -> Self {
        Self {
            seed: Some(Arc::new(seed)),
        }
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let seed: RecordSeed = toml::from_str(contents)?;
        Ok(Self::new(seed))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read seed file {}: {}", path.display(), e))?;
        let seed: RecordSeed = toml::from_str(&contents)?;
        info!(
            path = %path.display(),
            users = seed.users.len(),
            pets = seed.pets.len(),
            doctors = seed.doctors.len(),
            "Loaded record seed"
        );
        Ok(Self::new(seed))
    }

    /// A store that answers on behalf of `actor_id` (`None` = anonymous).
    pub fn for_actor(&self, actor_id: Option<String>) -> ActorRecordStore {
        ActorRecordStore {
            seed: self.seed.clone(),
            actor_id,
        }
    }

    pub fn doctor_count(&self) -> usize {
        self.seed.as_ref().map_or(0, |seed| seed.doctors.len())
    }
}

/// [`RecordStore`] view over [`InMemoryRecords`] for one actor.
#[derive(Debug, Clone)]
pub struct ActorRecordStore {
    seed: Option<Arc<RecordSeed>>,
    actor_id: Option<String>,
}

impl ActorRecordStore {
    fn seed(&self) -> Result<&RecordSeed, RecordError> {
        self.seed
            .as_deref()
            .ok_or_else(|| RecordError::Unavailable("no record seed loaded".to_string()))
    }

    fn actor(&self) -> Result<Option<&Actor>, RecordError> {
        let seed = self.seed()?;
        Ok(self
            .actor_id
            .as_deref()
            .and_then(|id| seed.users.iter().find(|user| user.id == id)))
    }
}

#[async_trait]
impl RecordStore for ActorRecordStore {
    async fn list_pets_for_current_actor(&self) -> Result<Vec<Pet>, RecordError> {
        let actor = self.actor()?.ok_or(RecordError::Unauthenticated)?;
        let pets: Vec<Pet> = self
            .seed()?
            .pets
            .iter()
            .filter(|pet| pet.owner_id == actor.id)
            .cloned()
            .collect();
        debug!(actor_id = %actor.id, count = pets.len(), "Listed pets");
        Ok(pets)
    }

    async fn current_actor(&self) -> Result<Option<Actor>, RecordError> {
        Ok(self.actor()?.cloned())
    }

    async fn search_available_doctors(&self, query: &str) -> Result<Vec<Doctor>, RecordError> {
        let needle = query.trim().to_lowercase();
        let mut doctors: Vec<Doctor> = self
            .seed()?
            .doctors
            .iter()
            .filter(|doctor| doctor.available)
            .filter(|doctor| needle.is_empty() || doctor.name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        doctors.sort_by(|a, b| a.name.cmp(&b.name));
        doctors.truncate(MAX_DOCTOR_RESULTS);
        Ok(doctors)
    }
}
