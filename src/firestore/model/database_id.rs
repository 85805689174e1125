use std::fmt::{Display, Formatter};

use crate::firestore::constants::DEFAULT_DATABASE_ID;
use crate::firestore::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    /// Parses `projects/{project}/databases/{database}`.
    pub fn from_resource_name(name: &str) -> FirestoreResult<Self> {
        let segments: Vec<_> = name.split('/').collect();
        if segments.len() == 4
            && segments[0] == "projects"
            && segments[2] == "databases"
            && !segments[1].is_empty()
            && !segments[3].is_empty()
        {
            return Ok(Self::new(segments[1], segments[3]));
        }
        Err(invalid_argument(format!(
            "Database identifier must follow projects/{{project}}/databases/{{database}}, got '{name}'"
        )))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    pub fn canonical_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.database)
    }
}
