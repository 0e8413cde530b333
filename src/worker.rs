//! Visit worker (C5, §4.5): given a `visit_id`, loads existing
//! surrogates, fetches new messages, merges them, persists the
//! result, and marks contributing messages processed.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::dimension::*;
use crate::error::WorkerError;
use crate::lab_state_machine::{attach_notes, reconstruct_labs, PendingLab};
use crate::locks::DimensionLocks;
use crate::models::mart::{Visit, VisitLabAssociation};
use crate::models::warehouse::{DxRow, FullMessage, NoteRow, Obx, ObservationRequest, PATIENT_CLASSES_WITH_VISITS};
use crate::select_or_insert::fetch as select_or_insert;
use crate::surrogate::{ClinicalObservationKind, ClinicalResolution, ClinicalValue, SurrogateDiagnosis, SurrogateLab, SurrogateVisit};
use crate::xml_strip::strip_xml;

/// Everything one worker needs: its own connection pools and the
/// dimension locks shared with its siblings (§5).
pub struct WorkerContext {
    pub warehouse: PgPool,
    pub mart: PgPool,
    pub locks: DimensionLocks,
}

/// Process every unprocessed message for `visit_id`, merging into the
/// mart and marking messages done. Returns `Ok(())` whether or not any
/// work actually happened — an empty unprocessed set is a no-op, not
/// an error.
pub async fn process_visit(ctx: &WorkerContext, visit_id: &str) -> Result<(), WorkerError> {
    let mut surrogates = load_existing_surrogates(&ctx.mart, visit_id).await?;
    let unprocessed_ids = load_unprocessed_msh_ids(&ctx.mart, visit_id).await?;
    if unprocessed_ids.is_empty() {
        return Ok(());
    }
    let messages = load_messages(&ctx.warehouse, &unprocessed_ids).await?;

    if messages.is_empty() {
        return Ok(());
    }

    let mut observation_msh_ids: Vec<i64> = Vec::new();
    let mut clinical_msh_ids: Vec<i64> = Vec::new();
    let mut no_class_window: Option<(NaiveDateTime, NaiveDateTime)> = None;

    for message in &messages {
        if message.is_order_message() {
            continue;
        }

        if message.is_observation_result() {
            let dt = message.message_datetime;
            no_class_window = Some(match no_class_window {
                Some((min, max)) => (min.min(dt), max.max(dt)),
                None => (dt, dt),
            });
            if !PATIENT_CLASSES_WITH_VISITS.contains(&message.patient_class.as_str()) {
                observation_msh_ids.push(message.msh_id);
            } else {
                clinical_msh_ids.push(message.msh_id);
            }
            continue;
        }

        let pc = if message.patient_class == "U" {
            if surrogates.len() == 1 {
                surrogates.keys().next().cloned().expect("len checked above")
            } else {
                warn!(visit_id, msh_id = message.msh_id, "unknown patient class with ambiguous routing, skipping message");
                continue;
            }
        } else {
            message.patient_class.clone()
        };

        let surrogate = surrogates
            .entry(pc.clone())
            .or_insert_with(|| SurrogateVisit::new(visit_id.to_string(), pc.clone(), message.patient_id.clone()));

        if let Some(last) = surrogate.last_message {
            if message.message_datetime < last {
                warn!(visit_id, msh_id = message.msh_id, "stale duplicate message, skipping");
                continue;
            }
        }

        merge_admission_message(&ctx.warehouse, surrogate, message).await?;
    }

    for surrogate in surrogates.values() {
        if surrogate.admit_datetime.is_none() {
            warn!(visit_id, "visit canceled: no admit_datetime observed in any message");
            mark_all_processed(&ctx.mart, visit_id).await?;
            return Err(WorkerError::Canceled { visit_id: visit_id.to_string() });
        }
    }

    persist_new_visits(&ctx.mart, &mut surrogates).await?;

    if !observation_msh_ids.is_empty() {
        let labs = reconstruct_labs_for_messages(&ctx.warehouse, &observation_msh_ids).await?;
        for surrogate in surrogates.values_mut() {
            for lab in &labs {
                surrogate.add_lab(pending_lab_to_surrogate(lab));
            }
        }
    }

    if !clinical_msh_ids.is_empty() {
        let obxes = load_obx_for_messages(&ctx.warehouse, &clinical_msh_ids).await?;
        for obx in &obxes {
            let Some(code) = obx.observation_id.as_deref().or(obx.alt_id.as_deref()) else { continue };
            let result = strip_xml(obx.observation_result.as_deref());
            for surrogate in surrogates.values_mut() {
                surrogate.add_clinical_observation(code, &result, obx.units.clone());
            }
        }
    }

    if let Some((min, max)) = no_class_window {
        for surrogate in surrogates.values_mut() {
            surrogate.extend_message_window(min);
            surrogate.extend_message_window(max);
        }
    }

    for surrogate in surrogates.values_mut() {
        associate_and_commit(ctx, surrogate).await?;
    }

    mark_all_processed(&ctx.mart, visit_id).await?;
    info!(visit_id, surrogates = surrogates.len(), "visit processed");
    Ok(())
}

fn pending_lab_to_surrogate(pending: &PendingLab) -> SurrogateLab {
    let status = pending.status.clone().unwrap_or_else(|| "X".to_string());
    let mut lab = SurrogateLab::new(
        pending.test_code.clone(),
        pending.test_text.clone(),
        pending.coding.clone(),
        pending.result.clone(),
        pending.result_unit.clone(),
        status,
    );
    lab.abn_code = pending.abn_code.clone();
    lab.abn_text = pending.abn_text.clone();
    lab.abn_coding = pending.abn_coding.clone();
    lab.collection_datetime = pending.collection_datetime;
    lab.report_datetime = pending.report_datetime;
    lab.specimen_source = pending.specimen_source.clone();
    lab.filler_order_no = pending.filler_order_no.clone();
    lab.performing_lab_code = pending.performing_lab_code.clone();
    lab.reference_range = pending.reference_range.clone();
    lab.note = pending.note.clone();
    lab.seal()
}

async fn load_existing_surrogates(mart: &PgPool, visit_id: &str) -> Result<HashMap<String, SurrogateVisit>, WorkerError> {
    let rows: Vec<Visit> = sqlx::query_as("SELECT * FROM fact_visit WHERE visit_id = $1")
        .bind(visit_id)
        .fetch_all(mart)
        .await?;
    Ok(rows.into_iter().map(|v| (v.patient_class.clone(), SurrogateVisit::from_existing(&v))).collect())
}

/// `message_processed` lives in the mart database (§3.2), while the
/// message rows themselves live in the warehouse (§3.1) — two separate
/// Postgres connections, so the unprocessed set has to be resolved
/// here first and the warehouse queried by `msh_id` afterward rather
/// than joined in one query.
async fn load_unprocessed_msh_ids(mart: &PgPool, visit_id: &str) -> Result<Vec<i64>, WorkerError> {
    Ok(sqlx::query_scalar(
        "SELECT hl7_msh_id FROM message_processed WHERE visit_id = $1 AND processed_datetime IS NULL",
    )
    .bind(visit_id)
    .fetch_all(mart)
    .await?)
}

async fn load_messages(warehouse: &PgPool, msh_ids: &[i64]) -> Result<Vec<FullMessage>, WorkerError> {
    let rows: Vec<FullMessage> = sqlx::query_as(
        "SELECT m.hl7_msh_id AS msh_id, m.message_datetime, m.message_type, m.message_control_id, \
                v.visit_id, v.patient_class, v.patient_id, v.admit_datetime, v.discharge_datetime, \
                v.gender, v.dob, v.zip, v.country, v.state, v.county, v.admission_source, \
                v.assigned_patient_location, v.chief_complaint, v.disposition, v.race, v.service_code, \
                f.npi AS facility_npi, f.local_code AS facility_local_code, \
                f.organization_name AS facility_organization_name, f.zip AS facility_zip, f.county AS facility_county \
         FROM hl7_msh m \
         JOIN hl7_visit v ON v.hl7_msh_id = m.hl7_msh_id \
         JOIN hl7_facility f ON f.hl7_msh_id = m.hl7_msh_id \
         WHERE m.hl7_msh_id = ANY($1) \
         ORDER BY m.message_datetime ASC",
    )
    .bind(msh_ids)
    .fetch_all(warehouse)
    .await?;
    Ok(rows)
}

async fn load_dx_for_message(warehouse: &PgPool, msh_id: i64) -> Result<Vec<DxRow>, WorkerError> {
    Ok(sqlx::query_as("SELECT * FROM hl7_dx WHERE msh_id = $1 ORDER BY rank")
        .bind(msh_id)
        .fetch_all(warehouse)
        .await?)
}

async fn load_obx_direct_for_message(warehouse: &PgPool, msh_id: i64) -> Result<Vec<Obx>, WorkerError> {
    Ok(sqlx::query_as("SELECT * FROM hl7_obx WHERE msh_id = $1 AND obr_id IS NULL")
        .bind(msh_id)
        .fetch_all(warehouse)
        .await?)
}

async fn load_obx_for_messages(warehouse: &PgPool, msh_ids: &[i64]) -> Result<Vec<Obx>, WorkerError> {
    Ok(sqlx::query_as("SELECT * FROM hl7_obx WHERE msh_id = ANY($1)")
        .bind(msh_ids)
        .fetch_all(warehouse)
        .await?)
}

async fn reconstruct_labs_for_messages(warehouse: &PgPool, msh_ids: &[i64]) -> Result<Vec<PendingLab>, WorkerError> {
    let obrs: Vec<ObservationRequest> = sqlx::query_as(
        "SELECT * FROM hl7_obr WHERE msh_id = ANY($1) ORDER BY observation_datetime, obr_id",
    )
    .bind(msh_ids)
    .fetch_all(warehouse)
    .await?;

    let mut pairs = Vec::with_capacity(obrs.len());
    let mut all_obr_ids = Vec::with_capacity(obrs.len());
    for obr in obrs {
        let obxes: Vec<Obx> = sqlx::query_as("SELECT * FROM hl7_obx WHERE obr_id = $1 ORDER BY obx_id")
            .bind(obr.obr_id)
            .fetch_all(warehouse)
            .await?;
        all_obr_ids.push(obr.obr_id);
        pairs.push((obr, obxes));
    }

    let mut labs = reconstruct_labs(&pairs)?;

    let notes: Vec<NoteRow> = sqlx::query_as(
        "SELECT * FROM hl7_note WHERE obr_id = ANY($1) ORDER BY obr_id, obx_id, sequence_number",
    )
    .bind(&all_obr_ids)
    .fetch_all(warehouse)
    .await?;
    attach_notes(&mut labs, &notes);

    Ok(labs)
}

/// Apply one admission-type message to `surrogate` (§4.5 step 3).
async fn merge_admission_message(warehouse: &PgPool, surrogate: &mut SurrogateVisit, message: &FullMessage) -> Result<(), WorkerError> {
    surrogate.first_message = Some(surrogate.first_message.map_or(message.message_datetime, |f| f.min(message.message_datetime)));
    surrogate.last_message = Some(message.message_datetime);

    surrogate.set_admit_datetime(message.admit_datetime);
    surrogate.set_discharge_datetime(message.discharge_datetime);
    surrogate.set_gender(message.gender.clone());
    surrogate.set_dob(message.dob);
    surrogate.set_disposition(message.disposition.as_deref().and_then(|d| d.parse::<i16>().ok()));
    surrogate.set_facility_npi(Some(message.facility_npi));

    surrogate.set_location(message.country.clone(), message.county.clone(), message.state.clone(), message.zip.clone());
    surrogate.set_admission_source(message.admission_source.clone());
    surrogate.set_assigned_location(message.assigned_patient_location.clone());
    surrogate.set_chief_complaint(message.chief_complaint.clone());
    surrogate.set_race(message.race.clone());
    surrogate.set_service_area(message.service_code.clone());

    for dx in load_dx_for_message(warehouse, message.msh_id).await? {
        if dx.dx_code.is_empty() {
            continue;
        }
        surrogate.add_diagnosis(SurrogateDiagnosis {
            rank: dx.rank,
            icd9: dx.dx_code,
            description: dx.dx_description,
            status: dx.dx_type,
            dx_datetime: Some(message.message_datetime),
        });
    }

    for obx in load_obx_direct_for_message(warehouse, message.msh_id).await? {
        let Some(code) = obx.observation_id.as_deref().or(obx.alt_id.as_deref()) else { continue };
        let result = strip_xml(obx.observation_result.as_deref());
        surrogate.add_clinical_observation(code, &result, obx.units.clone());
    }

    Ok(())
}

/// `dim_facility` is bootstrapped ahead of a run via static data and
/// carries no dedicated entry in [`DimensionLocks`] (see locks.rs) —
/// this is a plain lookup, never a select-or-insert.
async fn resolve_facility_pk(mart: &PgPool, npi: i64) -> Result<i64, WorkerError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT pk FROM dim_facility WHERE npi = $1")
        .bind(npi)
        .fetch_optional(mart)
        .await?;
    row.map(|(pk,)| pk).ok_or(WorkerError::UnknownFacility { npi })
}

async fn persist_new_visits(mart: &PgPool, surrogates: &mut HashMap<String, SurrogateVisit>) -> Result<(), WorkerError> {
    for surrogate in surrogates.values_mut() {
        if surrogate.pk.is_some() {
            continue;
        }
        let npi = surrogate.facility_npi.expect("merge_admission_message sets facility_npi before first persist");
        let dim_facility_pk = resolve_facility_pk(mart, npi).await?;

        let row: Visit = sqlx::query_as(
            "INSERT INTO fact_visit \
             (visit_id, patient_class, patient_id, admit_datetime, first_message, last_message, \
              discharge_datetime, dob, gender, ever_in_icu, dim_facility_pk) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *",
        )
        .bind(&surrogate.visit_id)
        .bind(&surrogate.patient_class)
        .bind(&surrogate.patient_id)
        .bind(surrogate.admit_datetime)
        .bind(
            surrogate
                .first_message
                .unwrap_or_else(|| surrogate.admit_datetime.expect("canceled-visit guard runs before persist_new_visits")),
        )
        .bind(
            surrogate
                .last_message
                .unwrap_or_else(|| surrogate.admit_datetime.expect("canceled-visit guard runs before persist_new_visits")),
        )
        .bind(surrogate.discharge_datetime)
        .bind(surrogate.dob)
        .bind(surrogate.gender.clone().unwrap_or_default())
        .bind(surrogate.ever_in_icu)
        .bind(dim_facility_pk)
        .fetch_one(mart)
        .await?;
        surrogate.pk = Some(row.pk);
    }
    Ok(())
}

/// Resolve every accumulated field into dimension foreign keys,
/// diff-and-insert diagnoses/labs, and commit the visit row (§4.5
/// step 8).
async fn associate_and_commit(ctx: &WorkerContext, surrogate: &mut SurrogateVisit) -> Result<(), WorkerError> {
    if !surrogate.is_modified() {
        return Ok(());
    }

    let dim_ar_pk = match &surrogate.admit_reason {
        Some(text) => Some(
            select_or_insert::<AdmitReasonRow>(&ctx.mart, &ctx.locks.admit_reason, AdmitReasonCandidate { admit_reason: text.clone() })
                .await?
                .pk,
        ),
        None => None,
    };
    let mut dim_cc_pk = match &surrogate.chief_complaint {
        Some(text) => Some(
            select_or_insert::<ChiefComplaintRow>(&ctx.mart, &ctx.locks.chief_complaint, ChiefComplaintCandidate { chief_complaint: text.clone() })
                .await?
                .pk,
        ),
        None => None,
    };
    let dim_race_pk = match &surrogate.race {
        Some(text) => Some(select_or_insert::<RaceRow>(&ctx.mart, &ctx.locks.race, RaceCandidate { race: text.clone() }).await?.pk),
        None => None,
    };
    let dim_service_area_pk = match &surrogate.service_area {
        Some(text) => Some(
            select_or_insert::<ServiceAreaRow>(&ctx.mart, &ctx.locks.service_area, ServiceAreaCandidate { area: text.clone() }).await?.pk,
        ),
        None => None,
    };
    let dim_assigned_location_pk = match &surrogate.assigned_location {
        Some(text) => Some(
            select_or_insert::<AssignedLocationRow>(&ctx.mart, &ctx.locks.assigned_location, AssignedLocationCandidate { location: text.clone() })
                .await?
                .pk,
        ),
        None => None,
    };
    let dim_disposition_pk = match surrogate.disposition {
        Some(code) => Some(
            select_or_insert::<DispositionRow>(
                &ctx.mart,
                &ctx.locks.disposition,
                DispositionCandidate { code, gipse_mapping: None, odin_mapping: None, description: None },
            )
            .await?
            .code,
        ),
        None => None,
    };
    let dim_admission_source_pk = match &surrogate.admission_source {
        Some(code) => Some(
            select_or_insert::<AdmissionSourceRow>(
                &ctx.mart,
                &ctx.locks.admission_source,
                AdmissionSourceCandidate { code: code.clone(), description: None },
            )
            .await?
            .code,
        ),
        None => None,
    };
    let dim_location_pk = if surrogate.country.is_some() || surrogate.county.is_some() || surrogate.state.is_some() || surrogate.zip.is_some() {
        Some(
            select_or_insert::<LocationRow>(
                &ctx.mart,
                &ctx.locks.location,
                LocationCandidate {
                    country: surrogate.country.clone(),
                    county: surrogate.county.clone(),
                    state: surrogate.state.clone(),
                    zip: surrogate.zip.clone(),
                },
            )
            .await?
            .pk,
        )
    } else {
        None
    };

    let mut dim_flu_vaccine_pk = None;
    let mut dim_h1n1_vaccine_pk = None;
    let mut dim_admission_o2sat_pk = None;
    let mut dim_admission_temp_pk = None;
    let mut dim_pregnancy_pk = None;
    let mut age = surrogate.ensure_age();

    for (code, obs) in &surrogate.clinical {
        let Some(kind) = ClinicalObservationKind::for_code(code) else { continue };
        match kind.resolve(obs) {
            ClinicalResolution::InvalidUnits { expected, actual } => {
                return Err(WorkerError::InvalidUnits {
                    code: leak_code(code),
                    expected,
                    actual: actual.unwrap_or_default(),
                });
            },
            ClinicalResolution::Unparseable => continue,
            ClinicalResolution::Value(value) => match value {
                // A chief complaint arriving only via an ORU 8661-1 OBX
                // (never via the admission message's own
                // `chief_complaint` field) must still resolve
                // `dim_cc_pk`, or it's silently left NULL. Unlike the
                // admission path's `set_chief_complaint` (§4.4), this
                // does not also set `dim_ar_pk` — the original's
                // `SurrogateChiefComplaint.associate` only ever binds
                // `dim_cc_pk`; `admit_reason` is populated solely from
                // the admission message's own field.
                ClinicalValue::Text(text) if kind == ClinicalObservationKind::ChiefComplaint => {
                    dim_cc_pk = Some(
                        select_or_insert::<ChiefComplaintRow>(&ctx.mart, &ctx.locks.chief_complaint, ChiefComplaintCandidate { chief_complaint: text })
                            .await?
                            .pk,
                    );
                },
                ClinicalValue::Text(status) if kind == ClinicalObservationKind::FluVaccine => {
                    dim_flu_vaccine_pk = Some(
                        select_or_insert::<FluVaccineRow>(&ctx.mart, &ctx.locks.flu_vaccine, FluVaccineCandidate { status })
                            .await?
                            .pk,
                    );
                },
                ClinicalValue::Text(status) if kind == ClinicalObservationKind::H1n1Vaccine => {
                    dim_h1n1_vaccine_pk = Some(
                        select_or_insert::<H1n1VaccineRow>(&ctx.mart, &ctx.locks.h1n1_vaccine, H1n1VaccineCandidate { status })
                            .await?
                            .pk,
                    );
                },
                ClinicalValue::Text(result) if kind == ClinicalObservationKind::Pregnancy => {
                    dim_pregnancy_pk = Some(
                        select_or_insert::<PregnancyRow>(&ctx.mart, &ctx.locks.pregnancy, PregnancyCandidate { result })
                            .await?
                            .pk,
                    );
                },
                ClinicalValue::O2Percent(percentage) => {
                    dim_admission_o2sat_pk = Some(
                        select_or_insert::<AdmissionO2satRow>(
                            &ctx.mart,
                            &ctx.locks.admission_o2sat,
                            AdmissionO2satCandidate { o2sat_percentage: percentage },
                        )
                        .await?
                        .pk,
                    );
                },
                ClinicalValue::TemperatureF(degrees) => {
                    dim_admission_temp_pk = Some(
                        select_or_insert::<AdmissionTempRow>(
                            &ctx.mart,
                            &ctx.locks.admission_temp,
                            AdmissionTempCandidate { degree_fahrenheit: degrees },
                        )
                        .await?
                        .pk,
                    );
                },
                ClinicalValue::Age(years) => {
                    age = age.or(Some(years));
                },
                _ => {},
            },
        }
    }

    let visit_pk = surrogate.pk.expect("persist_new_visits runs before associate_and_commit");

    sqlx::query(
        "UPDATE fact_visit SET admit_datetime = $2, discharge_datetime = $3, gender = $4, dob = $5, \
         ever_in_icu = $6, first_message = $7, last_message = $8, age = $9, \
         dim_ar_pk = $10, dim_cc_pk = $11, dim_disposition_pk = $12, dim_location_pk = $13, \
         dim_service_area_pk = $14, dim_flu_vaccine_pk = $15, dim_h1n1_vaccine_pk = $16, \
         dim_admission_temp_pk = $17, dim_admission_source_pk = $18, dim_admission_o2sat_pk = $19, \
         dim_assigned_location_pk = $20, dim_pregnancy_pk = $21, dim_race_pk = $22, last_updated = now() \
         WHERE pk = $1",
    )
    .bind(visit_pk)
    .bind(surrogate.admit_datetime)
    .bind(surrogate.discharge_datetime)
    .bind(surrogate.gender.clone().unwrap_or_default())
    .bind(surrogate.dob)
    .bind(surrogate.ever_in_icu)
    .bind(surrogate.first_message)
    .bind(surrogate.last_message)
    .bind(age)
    .bind(dim_ar_pk)
    .bind(dim_cc_pk)
    .bind(dim_disposition_pk)
    .bind(dim_location_pk)
    .bind(dim_service_area_pk)
    .bind(dim_flu_vaccine_pk)
    .bind(dim_h1n1_vaccine_pk)
    .bind(dim_admission_temp_pk)
    .bind(dim_admission_source_pk)
    .bind(dim_admission_o2sat_pk)
    .bind(dim_assigned_location_pk)
    .bind(dim_pregnancy_pk)
    .bind(dim_race_pk)
    .execute(&ctx.mart)
    .await?;

    associate_diagnoses(ctx, visit_pk, surrogate).await?;
    associate_labs(ctx, visit_pk, surrogate).await?;

    debug!(visit_pk, "surrogate committed");
    Ok(())
}

/// `&str` keys don't satisfy `&'static str`; LOINC codes are a fixed,
/// known-at-compile-time set, so this leaks a handful of short strings
/// at most once per process — acceptable for an error path.
fn leak_code(code: &str) -> &'static str {
    Box::leak(code.to_string().into_boxed_str())
}

async fn associate_diagnoses(ctx: &WorkerContext, visit_pk: i64, surrogate: &SurrogateVisit) -> Result<(), WorkerError> {
    let already: Vec<(String, String)> = sqlx::query_as(
        "SELECT dx.icd9, vd.status FROM visit_dx vd JOIN dim_dx dx ON dx.pk = vd.dim_dx_pk WHERE vd.fact_visit_pk = $1",
    )
    .bind(visit_pk)
    .fetch_all(&ctx.mart)
    .await?;

    for dx in &surrogate.diagnoses {
        if already.iter().any(|(icd9, status)| icd9 == &dx.icd9 && status == &dx.status) {
            continue;
        }
        let dim = select_or_insert::<DiagnosisRow>(
            &ctx.mart,
            &ctx.locks.diagnosis,
            DiagnosisCandidate { icd9: dx.icd9.clone(), description: dx.description.clone() },
        )
        .await?;
        sqlx::query(
            "INSERT INTO visit_dx (fact_visit_pk, dim_dx_pk, status, dx_datetime, rank, last_updated) \
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(visit_pk)
        .bind(dim.pk)
        .bind(&dx.status)
        .bind(dx.dx_datetime)
        .bind(dx.rank)
        .execute(&ctx.mart)
        .await?;
    }
    Ok(())
}

async fn associate_labs(ctx: &WorkerContext, visit_pk: i64, surrogate: &SurrogateVisit) -> Result<(), WorkerError> {
    let already: Vec<VisitLabAssociation> = sqlx::query_as("SELECT * FROM visit_lab WHERE fact_visit_pk = $1")
        .bind(visit_pk)
        .fetch_all(&ctx.mart)
        .await?;

    for lab in &surrogate.labs {
        let dim = select_or_insert::<crate::models::mart::LabResultRow>(
            &ctx.mart,
            &ctx.locks.lab_result,
            crate::dimension::LabResultCandidate::new(
                lab.coding.clone(),
                lab.test_code.clone(),
                lab.test_text.clone(),
                Some(lab.result.clone()),
                lab.units.clone(),
            ),
        )
        .await?;

        if already.iter().any(|a| a.dim_lab_result_pk == dim.pk && a.status == lab.status) {
            continue;
        }

        let lab_flag_pk = if lab.abn_code.is_some() || lab.abn_text.is_some() || lab.abn_coding.is_some() {
            Some(
                select_or_insert::<crate::models::mart::LabFlagRow>(
                    &ctx.mart,
                    &ctx.locks.lab_flag,
                    LabFlagCandidate {
                        code: lab.abn_code.clone().unwrap_or_default(),
                        code_text: lab.abn_text.clone(),
                        coding: lab.abn_coding.clone().unwrap_or_default(),
                    },
                )
                .await?
                .pk,
            )
        } else {
            None
        };

        let order_number_pk = match &lab.filler_order_no {
            Some(no) if !no.is_empty() => Some(
                select_or_insert::<OrderNumberRow>(&ctx.mart, &ctx.locks.order_number, OrderNumberCandidate { filler_order_no: no.clone() })
                    .await?
                    .pk,
            ),
            _ => None,
        };

        let performing_lab_pk = Some(
            select_or_insert::<PerformingLabRow>(
                &ctx.mart,
                &ctx.locks.performing_lab,
                PerformingLabCandidate { local_code: lab.performing_lab_code.clone() },
            )
            .await?
            .pk,
        );

        let reference_range_pk = match &lab.reference_range {
            Some(range) if !range.is_empty() => Some(
                select_or_insert::<ReferenceRangeRow>(&ctx.mart, &ctx.locks.reference_range, ReferenceRangeCandidate { range: range.clone() })
                    .await?
                    .pk,
            ),
            _ => None,
        };

        let specimen_source_pk = match &lab.specimen_source {
            Some(src) if !src.is_empty() => Some(
                select_or_insert::<SpecimenSourceRow>(&ctx.mart, &ctx.locks.specimen_source, SpecimenSourceCandidate { source: src.clone() })
                    .await?
                    .pk,
            ),
            _ => None,
        };

        let note_pk = match &lab.note {
            Some(note) if !note.is_empty() => Some(
                select_or_insert::<crate::models::mart::NoteRow>(
                    &ctx.mart,
                    &ctx.locks.note,
                    crate::dimension::NoteCandidate::new(note.clone()),
                )
                .await?
                .pk,
            ),
            _ => None,
        };

        sqlx::query(
            "INSERT INTO visit_lab \
             (fact_visit_pk, dim_lab_result_pk, dim_lab_flag_pk, dim_order_number_pk, dim_ref_range_pk, \
              dim_note_pk, dim_performing_lab_pk, dim_specimen_source_pk, status, report_datetime, \
              collection_datetime, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())",
        )
        .bind(visit_pk)
        .bind(dim.pk)
        .bind(lab_flag_pk)
        .bind(order_number_pk)
        .bind(reference_range_pk)
        .bind(note_pk)
        .bind(performing_lab_pk)
        .bind(specimen_source_pk)
        .bind(&lab.status)
        .bind(lab.report_datetime)
        .bind(lab.collection_datetime)
        .execute(&ctx.mart)
        .await?;
    }
    Ok(())
}

async fn mark_all_processed(mart: &PgPool, visit_id: &str) -> Result<(), WorkerError> {
    sqlx::query("UPDATE message_processed SET processed_datetime = now() WHERE processed_datetime IS NULL AND visit_id = $1")
        .bind(visit_id)
        .execute(mart)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn merge_admission_message_records_facility_npi() {
        let mut surrogate = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        assert_eq!(surrogate.facility_npi, None);

        surrogate.set_facility_npi(Some(1234567890));
        assert_eq!(surrogate.facility_npi, Some(1234567890));
    }

    #[test]
    fn stale_check_reads_last_message_before_mutation() {
        let mut surrogate = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        surrogate.last_message = Some(dt(2020, 6, 1));

        let incoming = dt(2020, 5, 1);
        let is_stale = surrogate.last_message.map(|last| incoming < last).unwrap_or(false);
        assert!(is_stale, "an earlier message_datetime than the current last_message must be flagged stale");

        assert_eq!(surrogate.last_message, Some(dt(2020, 6, 1)), "checking staleness must not itself mutate last_message");
    }
}
