//! Read-only view over the warehouse database (§3.1).
//!
//! The warehouse is append-only and owned upstream; these types are a
//! faithful projection of the columns the worker and manager actually
//! read, not a full ORM mapping of the warehouse schema.

use chrono::NaiveDateTime;

/// One row of `hl7_visit` joined to its parent `hl7_msh`, i.e. a
/// single HL7 message concerning one visit.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FullMessage {
    pub msh_id: i64,
    pub message_datetime: NaiveDateTime,
    pub message_type: String,
    pub message_control_id: String,

    pub visit_id: String,
    pub patient_class: String,
    pub patient_id: String,
    pub admit_datetime: Option<NaiveDateTime>,
    pub discharge_datetime: Option<NaiveDateTime>,
    pub gender: Option<String>,
    pub dob: Option<NaiveDateTime>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub county: Option<String>,
    pub admission_source: Option<String>,
    pub assigned_patient_location: Option<String>,
    pub chief_complaint: Option<String>,
    pub disposition: Option<String>,
    pub race: Option<String>,
    pub service_code: Option<String>,

    pub facility_npi: i64,
    pub facility_local_code: String,
    pub facility_organization_name: String,
    pub facility_zip: String,
    pub facility_county: String,
}

impl FullMessage {
    /// `ORU^R01^ORU_R01` carries observations/labs rather than an
    /// admission event; `patient_class` for these messages is not
    /// meaningful for visit routing (see worker §4.5 step 3).
    pub fn is_observation_result(&self) -> bool {
        self.message_type == "ORU^R01^ORU_R01"
    }

    /// `ORM^O01^ORM_O01` carries no value for the mart.
    pub fn is_order_message(&self) -> bool {
        self.message_type == "ORM^O01^ORM_O01"
    }
}

/// A diagnosis line attached to a message (HL7 `DG1`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DxRow {
    pub msh_id: i64,
    pub rank: i16,
    pub dx_code: String,
    pub dx_description: Option<String>,
    /// (W)orking, (A)dmitting, (F)inal.
    pub dx_type: String,
}

/// One `OBR` segment: an observation request grouping zero or more
/// `OBX` result segments.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ObservationRequest {
    pub obr_id: i64,
    pub msh_id: i64,
    pub observation_datetime: Option<NaiveDateTime>,
    pub report_datetime: Option<NaiveDateTime>,
    pub status: Option<String>,
    pub loinc_code: Option<String>,
    pub loinc_text: Option<String>,
    pub alt_code: Option<String>,
    pub alt_text: Option<String>,
    pub coding: Option<String>,
    pub alt_coding: Option<String>,
    pub specimen_source: Option<String>,
    pub filler_order_no: Option<String>,
}

/// One `OBX` segment: a single observation/result value.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Obx {
    pub obx_id: i64,
    pub obr_id: Option<i64>,
    pub msh_id: i64,
    pub observation_id: Option<String>,
    pub observation_text: Option<String>,
    pub coding: Option<String>,
    pub alt_id: Option<String>,
    pub alt_text: Option<String>,
    pub alt_coding: Option<String>,
    pub observation_result: Option<String>,
    pub units: Option<String>,
    /// Raw OBX-4.1 sub-id text, e.g. `""`, `"1"`, `"1.2"`.
    pub sequence: Option<String>,
    pub result_status: Option<String>,
    pub reference_range: Option<String>,
    pub performing_lab_code: Option<String>,
    pub abn_code: Option<String>,
    pub abn_text: Option<String>,
    pub abn_coding: Option<String>,
    pub alt_abn_code: Option<String>,
    pub alt_abn_text: Option<String>,
    pub alt_abn_coding: Option<String>,
}

/// An `NTE` note segment, attached to either an OBR or a specific OBX.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NoteRow {
    pub obr_id: Option<i64>,
    pub obx_id: Option<i64>,
    pub sequence_number: i32,
    pub note: String,
}

/// Recognized HL7 patient-class codes. `U` (unknown) is the routing
/// fallback when no class is present on a message.
pub const PATIENT_CLASSES_WITH_VISITS: [&str; 3] = ["E", "I", "O"];
