//! Application: a named collection of resources sharing a spec and a team owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ingested application. The `name` is the domain-unique identity used
/// everywhere else (resource rows, graph node keys, workflow execution rows)
/// — there is no surrogate id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub team: String,
    pub created_by: String,
    /// Opaque Score spec payload. The core never inspects its contents.
    pub spec: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_serde_roundtrip() {
        let app = Application {
            name: "blog".to_string(),
            team: "platform".to_string(),
            created_by: "alice".to_string(),
            spec: serde_json::json!({"containers": {}}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&app).unwrap();
        let back: Application = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "blog");
    }
}
