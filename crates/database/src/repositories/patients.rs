use crate::context::TenantSession;
use crate::error::{DatabaseError, Result};
use medrec_models::{Encounter, NewEncounter, NewPatient, Patient};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct PatientRepository;

impl PatientRepository {
    pub fn new() -> Self {
        Self
    }

    /// Create a new patient
    pub async fn create(&self, session: &mut TenantSession, new_patient: &NewPatient) -> Result<Patient> {
        let patient = sqlx::query_as::<_, Patient>(
            r#"
            INSERT INTO patients (mrn, family_name, given_name, birth_date)
            VALUES ($1, $2, $3, $4)
            RETURNING id, mrn, family_name, given_name, birth_date, created_at
            "#,
        )
        .bind(&new_patient.mrn)
        .bind(&new_patient.family_name)
        .bind(&new_patient.given_name)
        .bind(new_patient.birth_date)
        .fetch_one(session.connection())
        .await?;

        Ok(patient)
    }

    /// Find patient by ID
    pub async fn find_by_id(&self, session: &mut TenantSession, id: Uuid) -> Result<Patient> {
        let patient = sqlx::query_as::<_, Patient>(
            "SELECT id, mrn, family_name, given_name, birth_date, created_at FROM patients WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(session.connection())
        .await?
        .ok_or_else(|| DatabaseError::not_found("Patient", &id.to_string()))?;

        Ok(patient)
    }

    /// Find patient by medical record number
    pub async fn find_by_mrn(&self, session: &mut TenantSession, mrn: &str) -> Result<Option<Patient>> {
        let patient = sqlx::query_as::<_, Patient>(
            "SELECT id, mrn, family_name, given_name, birth_date, created_at FROM patients WHERE mrn = $1",
        )
        .bind(mrn)
        .fetch_optional(session.connection())
        .await?;

        Ok(patient)
    }

    /// List patients - paginated
    pub async fn list(&self, session: &mut TenantSession, limit: i64, offset: i64) -> Result<Vec<Patient>> {
        let patients = sqlx::query_as::<_, Patient>(
            r#"
            SELECT id, mrn, family_name, given_name, birth_date, created_at
            FROM patients
            ORDER BY family_name, given_name, id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(session.connection())
        .await?;

        Ok(patients)
    }

    pub async fn count(&self, session: &mut TenantSession) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM patients")
            .fetch_one(session.connection())
            .await?;

        Ok(count)
    }

    /// Delete patient, returns whether a row was removed
    pub async fn delete(&self, session: &mut TenantSession, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM patients WHERE id = $1")
            .bind(id)
            .execute(session.connection())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Register a patient together with their first encounter in one transaction
    pub async fn create_with_encounter(
        &self,
        session: &mut TenantSession,
        new_patient: &NewPatient,
        class: &str,
    ) -> Result<(Patient, Encounter)> {
        let mut tx = session.begin().await?;

        let patient = sqlx::query_as::<_, Patient>(
            r#"
            INSERT INTO patients (mrn, family_name, given_name, birth_date)
            VALUES ($1, $2, $3, $4)
            RETURNING id, mrn, family_name, given_name, birth_date, created_at
            "#,
        )
        .bind(&new_patient.mrn)
        .bind(&new_patient.family_name)
        .bind(&new_patient.given_name)
        .bind(new_patient.birth_date)
        .fetch_one(&mut *tx)
        .await?;

        let encounter = super::encounters::insert(
            &mut tx,
            &NewEncounter {
                patient_id: patient.id,
                class: class.to_string(),
                status: "in-progress".to_string(),
            },
        )
        .await?;

        tx.commit().await?;
        Ok((patient, encounter))
    }
}
