//! Owned mart star schema (§3.2): fact, dimensions, associations and
//! bookkeeping tables. Field names follow `tables.py` so the SQL in
//! `select_or_insert`/`worker` stays legible against the migrations.

use chrono::NaiveDateTime;

/// The `visit` fact row, unique on `(visit_id, patient_class)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Visit {
    pub pk: i64,
    pub visit_id: String,
    pub patient_class: String,
    pub patient_id: String,
    pub admit_datetime: NaiveDateTime,
    pub first_message: NaiveDateTime,
    pub last_message: NaiveDateTime,
    pub discharge_datetime: Option<NaiveDateTime>,
    pub age: Option<i16>,
    pub dob: Option<NaiveDateTime>,
    pub gender: String,
    pub ever_in_icu: bool,
    /// Initialized to 99 by the migration; never written by the
    /// engine (see SPEC_FULL.md §9 open question).
    pub influenza_test_summary: i16,
    pub dim_ar_pk: Option<i64>,
    pub dim_cc_pk: Option<i64>,
    pub dim_disposition_pk: Option<i16>,
    pub dim_facility_pk: i64,
    pub dim_location_pk: Option<i64>,
    pub dim_service_area_pk: Option<i64>,
    pub dim_flu_vaccine_pk: Option<i64>,
    pub dim_h1n1_vaccine_pk: Option<i64>,
    pub dim_admission_temp_pk: Option<i64>,
    pub dim_admission_source_pk: Option<String>,
    pub dim_admission_o2sat_pk: Option<i64>,
    pub dim_assigned_location_pk: Option<i64>,
    pub dim_pregnancy_pk: Option<i64>,
    pub dim_race_pk: Option<i64>,
    pub last_updated: NaiveDateTime,
}

/// `visit_dx` association row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VisitDiagnosisAssociation {
    pub fact_visit_pk: i64,
    pub dim_dx_pk: i64,
    /// (W)orking, (A)dmitting, (F)inal.
    pub status: String,
    pub dx_datetime: Option<NaiveDateTime>,
    pub rank: i16,
    pub last_updated: NaiveDateTime,
}

/// `visit_lab` association row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VisitLabAssociation {
    pub fact_visit_pk: i64,
    pub dim_lab_result_pk: i64,
    pub dim_lab_flag_pk: Option<i64>,
    pub dim_order_number_pk: Option<i64>,
    pub dim_ref_range_pk: Option<i64>,
    pub dim_note_pk: Option<i64>,
    pub dim_performing_lab_pk: Option<i64>,
    pub dim_specimen_source_pk: Option<i64>,
    /// (P)reliminary, (A)ctive, (F)inal, (X) unspecified.
    pub status: String,
    pub report_datetime: Option<NaiveDateTime>,
    pub collection_datetime: Option<NaiveDateTime>,
    pub last_updated: NaiveDateTime,
}

/// `message_processed` bookkeeping row (C6).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageProcessed {
    pub hl7_msh_id: i64,
    pub message_datetime: NaiveDateTime,
    pub visit_id: String,
    pub processed_datetime: Option<NaiveDateTime>,
}

/// `reportable_region` read-only set used by the report module.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReportableRegion {
    pub region_name: String,
    pub dim_facility_pk: i64,
}

/// A flattened `essence` view row (§6).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EssenceRow {
    pub visit_pk: i64,
    pub hospital: Option<String>,
    pub visit_date: Option<String>,
    pub visit_time: Option<String>,
    pub gender: String,
    pub age: Option<i16>,
    pub chief_complaint: Option<String>,
    pub zip: Option<String>,
    pub gipse_disposition: Option<String>,
    pub odin_disposition: Option<String>,
    pub patient_id: String,
    pub visit_id: String,
    pub patient_class: String,
    pub measured_temperature: Option<f64>,
    pub o2_saturation: Option<i16>,
    pub influenza_vaccine: Option<String>,
    pub h1n1_vaccine: Option<String>,
}

macro_rules! dimension_row {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, sqlx::FromRow)]
        pub struct $name {
            pub pk: i64,
            $(pub $field: $ty,)*
            pub last_updated: NaiveDateTime,
        }
    };
}

/// `admission_source` and `disposition` use their own `code` as the
/// table's primary key rather than a synthetic surrogate (SPEC_FULL.md
/// §3.2: "code, PK itself") — these two are hand-shaped instead of
/// going through [`dimension_row!`], which always adds a synthetic
/// `pk` column that neither table has.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AdmissionSourceRow {
    pub code: String,
    pub description: String,
    pub last_updated: NaiveDateTime,
}

dimension_row!(AdmissionTempRow { degree_fahrenheit: f64 });
dimension_row!(AdmissionO2satRow { o2sat_percentage: i16 });
dimension_row!(AssignedLocationRow { location: String });
dimension_row!(AdmitReasonRow { admit_reason: String });
dimension_row!(ChiefComplaintRow { chief_complaint: String });
dimension_row!(LocationRow {
    country: Option<String>,
    county: Option<String>,
    state: Option<String>,
    zip: Option<String>,
});
/// Also `code`-as-PK, like [`AdmissionSourceRow`] above.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DispositionRow {
    pub code: i16,
    pub gipse_mapping: String,
    pub odin_mapping: String,
    pub description: String,
    pub last_updated: NaiveDateTime,
}
dimension_row!(FacilityRow {
    npi: i64,
    local_code: String,
    organization_name: String,
    zip: String,
    county: String,
});
dimension_row!(LabFlagRow { code: String, code_text: Option<String>, coding: String });
dimension_row!(LabResultRow {
    coding: Option<String>,
    test_code: String,
    test_text: Option<String>,
    result: Option<String>,
    result_unit: Option<String>,
});
dimension_row!(OrderNumberRow { filler_order_no: String });
dimension_row!(NoteRow { note: String });
dimension_row!(PerformingLabRow { local_code: Option<String> });
dimension_row!(PregnancyRow { result: String });
dimension_row!(RaceRow { race: String });
dimension_row!(ReferenceRangeRow { range: String });
dimension_row!(ServiceAreaRow { area: String });
dimension_row!(SpecimenSourceRow { source: String });
dimension_row!(FluVaccineRow { status: String });
dimension_row!(H1n1VaccineRow { status: String });
dimension_row!(DiagnosisRow { icd9: String, description: Option<String> });

/// `note` and `lab_result.result` are both truncated at this length
/// before insert (§3.3).
pub const MAX_RESULT_LEN: usize = 500;
pub const MAX_NOTE_LEN: usize = 500;

/// Truncate a string to at most `max` bytes on a char boundary.
pub fn truncate_to(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
