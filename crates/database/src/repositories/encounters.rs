use crate::context::TenantSession;
use crate::error::Result;
use medrec_models::{Encounter, NewEncounter};
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct EncounterRepository;

impl EncounterRepository {
    pub fn new() -> Self {
        Self
    }

    /// Open an encounter for a patient
    pub async fn create(&self, session: &mut TenantSession, new_encounter: &NewEncounter) -> Result<Encounter> {
        insert(session.connection(), new_encounter).await
    }

    /// List encounters of one patient, newest first
    pub async fn list_for_patient(&self, session: &mut TenantSession, patient_id: Uuid) -> Result<Vec<Encounter>> {
        let encounters = sqlx::query_as::<_, Encounter>(
            r#"
            SELECT id, patient_id, class, status, started_at
            FROM encounters
            WHERE patient_id = $1
            ORDER BY started_at DESC
            "#,
        )
        .bind(patient_id)
        .fetch_all(session.connection())
        .await?;

        Ok(encounters)
    }
}

pub(crate) async fn insert(conn: &mut PgConnection, new_encounter: &NewEncounter) -> Result<Encounter> {
    let encounter = sqlx::query_as::<_, Encounter>(
        r#"
        INSERT INTO encounters (patient_id, class, status)
        VALUES ($1, $2, $3)
        RETURNING id, patient_id, class, status, started_at
        "#,
    )
    .bind(new_encounter.patient_id)
    .bind(&new_encounter.class)
    .bind(&new_encounter.status)
    .fetch_one(conn)
    .await?;

    Ok(encounter)
}
