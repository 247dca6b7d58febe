use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Patient record stored in a tenant namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Patient {
    pub id: Uuid,
    /// Medical record number, the tenant-local business key
    pub mrn: String,
    pub family_name: String,
    pub given_name: String,
    pub birth_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Create patient request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewPatient {
    #[validate(length(min = 1, max = 64))]
    pub mrn: String,

    #[validate(length(min = 1, max = 255))]
    pub family_name: String,

    #[validate(length(min = 1, max = 255))]
    pub given_name: String,

    pub birth_date: Option<NaiveDate>,
}

/// Encounter (visit) belonging to a patient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Encounter {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub class: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

/// Create encounter request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewEncounter {
    pub patient_id: Uuid,

    #[validate(length(min = 1, max = 32))]
    pub class: String,

    #[validate(length(min = 1, max = 32))]
    pub status: String,
}
