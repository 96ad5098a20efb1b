use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::PersonError;

pub type PersonId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub uuid: Uuid,
    pub team_id: i32,
    pub properties: Value,
    pub is_identified: bool,
    pub created_at: DateTime<Utc>,
    pub version: Option<i64>,
}

/// Looks up the person behind a distinct id. Implementations talk to the
/// person store and should return `PersonError::DependencyUnavailable` when
/// it can't be reached.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersonProvider: Send + Sync {
    async fn fetch(&self, team_id: i32, distinct_id: &str) -> Result<Option<Person>, PersonError>;
}

/// Lazily resolved person for one pipeline invocation.
///
/// The lookup runs at most once, no matter how many steps ask for it, and
/// concurrent callers wait on the same lookup. A failed lookup is not
/// memoized, so a later `get` tries again.
///
/// Containers are not `Clone`: each invocation creates its own and moves it
/// from step to step.
pub struct PersonContainer {
    team_id: i32,
    distinct_id: String,
    provider: Arc<dyn PersonProvider>,
    person: OnceCell<Option<Person>>,
}

impl PersonContainer {
    pub fn new(team_id: i32, distinct_id: impl Into<String>, provider: Arc<dyn PersonProvider>) -> Self {
        PersonContainer {
            team_id,
            distinct_id: distinct_id.into(),
            provider,
            person: OnceCell::new(),
        }
    }

    pub fn team_id(&self) -> i32 {
        self.team_id
    }

    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }

    pub async fn get(&self) -> Result<Option<&Person>, PersonError> {
        let person = self
            .person
            .get_or_try_init(|| self.provider.fetch(self.team_id, &self.distinct_id))
            .await?;

        Ok(person.as_ref())
    }

    pub fn is_loaded(&self) -> bool {
        self.person.initialized()
    }

    /// Replace whatever was resolved with a person the caller just wrote.
    pub fn with_person(self, person: Option<Person>) -> Self {
        PersonContainer {
            person: OnceCell::new_with(Some(person)),
            ..self
        }
    }
}

// Containers end up in results, logs and error reports. Only a small
// projection goes out, never the person itself.
impl Serialize for PersonContainer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("PersonContainer", 3)?;
        state.serialize_field("team_id", &self.team_id)?;
        state.serialize_field("distinct_id", &self.distinct_id)?;
        state.serialize_field("loaded", &self.is_loaded())?;
        state.end()
    }
}

impl fmt::Debug for PersonContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonContainer")
            .field("team_id", &self.team_id)
            .field("distinct_id", &self.distinct_id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
