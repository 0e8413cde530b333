//! Dimension catalog (C2): one `Dimension` impl per star-schema
//! dimension table, each declaring its identifying-fields tuple via
//! `select`/`insert`. This replaces the original's runtime attribute
//! reflection with a compile-time trait per dimension.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::mart::*;

/// A dimension table: a candidate value goes in, a persisted row with
/// a primary key comes out. `select` must filter on exactly the
/// identifying fields so two candidates with equal identifying fields
/// always resolve to the same row.
#[async_trait]
pub trait Dimension: Sized + Send + Sync + 'static {
    type Candidate: Clone + Send + Sync + std::fmt::Debug;
    const NAME: &'static str;

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error>;
    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error>;
}

/// Declares a `Dimension` impl for a simple, single-text-identifying-field
/// table shaped like `(pk, <field>, last_updated)`.
macro_rules! simple_text_dimension {
    ($row:ty, $candidate:ident, $name:literal, $table:literal, $column:ident) => {
        #[derive(Debug, Clone)]
        pub struct $candidate {
            pub $column: String,
        }

        #[async_trait]
        impl Dimension for $row {
            type Candidate = $candidate;
            const NAME: &'static str = $name;

            async fn select(
                pool: &PgPool,
                candidate: &Self::Candidate,
            ) -> Result<Vec<Self>, sqlx::Error> {
                sqlx::query_as(concat!(
                    "SELECT * FROM ",
                    $table,
                    " WHERE ",
                    stringify!($column),
                    " = $1"
                ))
                .bind(&candidate.$column)
                .fetch_all(pool)
                .await
            }

            async fn insert(
                pool: &PgPool,
                candidate: &Self::Candidate,
            ) -> Result<Self, sqlx::Error> {
                sqlx::query_as(concat!(
                    "INSERT INTO ",
                    $table,
                    " (",
                    stringify!($column),
                    ") VALUES ($1) RETURNING *"
                ))
                .bind(&candidate.$column)
                .fetch_one(pool)
                .await
            }
        }
    };
}

simple_text_dimension!(AssignedLocationRow, AssignedLocationCandidate, "assigned_location", "dim_assigned_location", location);
simple_text_dimension!(AdmitReasonRow, AdmitReasonCandidate, "admit_reason", "dim_ar", admit_reason);
simple_text_dimension!(ChiefComplaintRow, ChiefComplaintCandidate, "chief_complaint", "dim_cc", chief_complaint);
simple_text_dimension!(RaceRow, RaceCandidate, "race", "dim_race", race);
simple_text_dimension!(ServiceAreaRow, ServiceAreaCandidate, "service_area", "dim_service_area", area);
simple_text_dimension!(PregnancyRow, PregnancyCandidate, "pregnancy", "dim_pregnancy", result);
simple_text_dimension!(FluVaccineRow, FluVaccineCandidate, "flu_vaccine", "dim_flu_vaccine", status);
simple_text_dimension!(H1n1VaccineRow, H1n1VaccineCandidate, "h1n1_vaccine", "dim_h1n1_vaccine", status);
simple_text_dimension!(SpecimenSourceRow, SpecimenSourceCandidate, "specimen_source", "dim_specimen_source", source);
simple_text_dimension!(ReferenceRangeRow, ReferenceRangeCandidate, "reference_range", "dim_ref_range", range);
simple_text_dimension!(OrderNumberRow, OrderNumberCandidate, "order_number", "dim_order_number", filler_order_no);

#[derive(Debug, Clone)]
pub struct AdmissionTempCandidate {
    /// Already rounded to one decimal place by the caller (§4.4).
    pub degree_fahrenheit: f64,
}

#[async_trait]
impl Dimension for AdmissionTempRow {
    type Candidate = AdmissionTempCandidate;
    const NAME: &'static str = "admission_temp";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_admission_temp WHERE degree_fahrenheit = $1")
            .bind(candidate.degree_fahrenheit)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_admission_temp (degree_fahrenheit) VALUES ($1) RETURNING *",
        )
        .bind(candidate.degree_fahrenheit)
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionO2satCandidate {
    pub o2sat_percentage: i16,
}

#[async_trait]
impl Dimension for AdmissionO2satRow {
    type Candidate = AdmissionO2satCandidate;
    const NAME: &'static str = "admission_o2sat";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_admission_o2sat WHERE o2sat_percentage = $1")
            .bind(candidate.o2sat_percentage)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_admission_o2sat (o2sat_percentage) VALUES ($1) RETURNING *",
        )
        .bind(candidate.o2sat_percentage)
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct LocationCandidate {
    pub country: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[async_trait]
impl Dimension for LocationRow {
    type Candidate = LocationCandidate;
    const NAME: &'static str = "location";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM dim_location WHERE country IS NOT DISTINCT FROM $1 \
             AND county IS NOT DISTINCT FROM $2 AND state IS NOT DISTINCT FROM $3 \
             AND zip IS NOT DISTINCT FROM $4",
        )
        .bind(&candidate.country)
        .bind(&candidate.county)
        .bind(&candidate.state)
        .bind(&candidate.zip)
        .fetch_all(pool)
        .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_location (country, county, state, zip) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(&candidate.country)
        .bind(&candidate.county)
        .bind(&candidate.state)
        .bind(&candidate.zip)
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionSourceCandidate {
    pub code: String,
    pub description: Option<String>,
}

#[async_trait]
impl Dimension for AdmissionSourceRow {
    type Candidate = AdmissionSourceCandidate;
    const NAME: &'static str = "admission_source";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_admission_source WHERE code = $1")
            .bind(&candidate.code)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_admission_source (code, description) VALUES ($1, $2) RETURNING *",
        )
        .bind(&candidate.code)
        .bind(candidate.description.clone().unwrap_or_default())
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct DispositionCandidate {
    pub code: i16,
    pub gipse_mapping: Option<String>,
    pub odin_mapping: Option<String>,
    pub description: Option<String>,
}

#[async_trait]
impl Dimension for DispositionRow {
    type Candidate = DispositionCandidate;
    const NAME: &'static str = "disposition";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_disposition WHERE code = $1")
            .bind(candidate.code)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_disposition (code, gipse_mapping, odin_mapping, description) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(candidate.code)
        .bind(candidate.gipse_mapping.clone().unwrap_or_default())
        .bind(candidate.odin_mapping.clone().unwrap_or_default())
        .bind(candidate.description.clone().unwrap_or_default())
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct FacilityCandidate {
    pub npi: i64,
    pub local_code: String,
    pub organization_name: String,
    pub zip: String,
    pub county: String,
}

#[async_trait]
impl Dimension for FacilityRow {
    type Candidate = FacilityCandidate;
    const NAME: &'static str = "facility";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_facility WHERE npi = $1")
            .bind(candidate.npi)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_facility (npi, local_code, organization_name, zip, county) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(candidate.npi)
        .bind(&candidate.local_code)
        .bind(&candidate.organization_name)
        .bind(&candidate.zip)
        .bind(&candidate.county)
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosisCandidate {
    pub icd9: String,
    pub description: Option<String>,
}

#[async_trait]
impl Dimension for DiagnosisRow {
    type Candidate = DiagnosisCandidate;
    const NAME: &'static str = "diagnosis";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_dx WHERE icd9 = $1")
            .bind(&candidate.icd9)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as("INSERT INTO dim_dx (icd9, description) VALUES ($1, $2) RETURNING *")
            .bind(&candidate.icd9)
            .bind(&candidate.description)
            .fetch_one(pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct LabFlagCandidate {
    pub code: String,
    pub code_text: Option<String>,
    pub coding: String,
}

#[async_trait]
impl Dimension for LabFlagRow {
    type Candidate = LabFlagCandidate;
    const NAME: &'static str = "lab_flag";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_lab_flag WHERE code = $1 AND coding = $2")
            .bind(&candidate.code)
            .bind(&candidate.coding)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_lab_flag (code, code_text, coding) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&candidate.code)
        .bind(&candidate.code_text)
        .bind(&candidate.coding)
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct LabResultCandidate {
    pub coding: Option<String>,
    pub test_code: String,
    pub test_text: Option<String>,
    pub result: Option<String>,
    pub result_unit: Option<String>,
}

impl LabResultCandidate {
    /// `result` is truncated to [`MAX_RESULT_LEN`] the same way the
    /// original source's `LabResult.__init__` does it, before it ever
    /// reaches the identifying-fields comparison.
    pub fn new(
        coding: Option<String>,
        test_code: String,
        test_text: Option<String>,
        result: Option<String>,
        result_unit: Option<String>,
    ) -> Self {
        Self {
            coding,
            test_code,
            test_text,
            result: result.map(|r| truncate_to(&r, MAX_RESULT_LEN)),
            result_unit,
        }
    }
}

#[async_trait]
impl Dimension for LabResultRow {
    type Candidate = LabResultCandidate;
    const NAME: &'static str = "lab_result";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM dim_lab_result WHERE test_code = $1 \
             AND test_text IS NOT DISTINCT FROM $2 AND coding IS NOT DISTINCT FROM $3 \
             AND result IS NOT DISTINCT FROM $4 AND result_unit IS NOT DISTINCT FROM $5",
        )
        .bind(&candidate.test_code)
        .bind(&candidate.test_text)
        .bind(&candidate.coding)
        .bind(&candidate.result)
        .bind(&candidate.result_unit)
        .fetch_all(pool)
        .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as(
            "INSERT INTO dim_lab_result (coding, test_code, test_text, result, result_unit) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(&candidate.coding)
        .bind(&candidate.test_code)
        .bind(&candidate.test_text)
        .bind(&candidate.result)
        .bind(&candidate.result_unit)
        .fetch_one(pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct NoteCandidate {
    pub note: String,
}

impl NoteCandidate {
    pub fn new(note: impl Into<String>) -> Self {
        Self { note: truncate_to(&note.into(), MAX_NOTE_LEN) }
    }
}

#[async_trait]
impl Dimension for NoteRow {
    type Candidate = NoteCandidate;
    const NAME: &'static str = "note";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_note WHERE note = $1")
            .bind(&candidate.note)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as("INSERT INTO dim_note (note) VALUES ($1) RETURNING *")
            .bind(&candidate.note)
            .fetch_one(pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct PerformingLabCandidate {
    pub local_code: Option<String>,
}

#[async_trait]
impl Dimension for PerformingLabRow {
    type Candidate = PerformingLabCandidate;
    const NAME: &'static str = "performing_lab";

    async fn select(pool: &PgPool, candidate: &Self::Candidate) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM dim_performing_lab WHERE local_code IS NOT DISTINCT FROM $1")
            .bind(&candidate.local_code)
            .fetch_all(pool)
            .await
    }

    async fn insert(pool: &PgPool, candidate: &Self::Candidate) -> Result<Self, sqlx::Error> {
        sqlx::query_as("INSERT INTO dim_performing_lab (local_code) VALUES ($1) RETURNING *")
            .bind(&candidate.local_code)
            .fetch_one(pool)
            .await
    }
}
