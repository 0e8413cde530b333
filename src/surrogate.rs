//! Surrogate visit (C4, §4.4): the in-memory merge buffer for one
//! `(visit_id, patient_class)` during a worker run.

use std::collections::HashSet;

use chrono::NaiveDateTime;

use crate::models::mart::{truncate_to, Visit, MAX_NOTE_LEN};

/// LOINC codes the merge recognizes as clinical observations (§4.4).
pub const CLINICAL_LOINC_CODES: [&str; 8] =
    ["8661-1", "29553-5", "46077-4", "29544-4", "20564-1", "59408-5", "8310-5", "11449-6"];

/// `43140-3` ("clinical finding present") is explicitly excluded from
/// the generic diagnosis-like observation path (§4.4).
pub const EXCLUDED_OBSERVATION_CODE: &str = "43140-3";

/// A single recognized clinical observation awaiting association.
/// Only the first non-empty `(result, units)` pair seen for a given
/// LOINC code is kept.
#[derive(Debug, Clone)]
pub struct ClinicalObservation {
    pub result: String,
    pub units: Option<String>,
}

/// Replaces the original source's per-LOINC-code class hierarchy with
/// polymorphic `associate()` (§9 "dynamic dispatch on LOINC code
/// class"): a flat tag plus a `match`-driven transform, decided once
/// per code at compile time rather than looked up at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClinicalObservationKind {
    ChiefComplaint,
    Age,
    FluVaccine,
    H1n1Vaccine,
    O2Saturation,
    Temperature,
    Pregnancy,
}

impl ClinicalObservationKind {
    pub fn for_code(code: &str) -> Option<Self> {
        match code {
            "8661-1" => Some(Self::ChiefComplaint),
            "29553-5" => Some(Self::Age),
            "46077-4" => Some(Self::FluVaccine),
            "29544-4" => Some(Self::H1n1Vaccine),
            "20564-1" | "59408-5" => Some(Self::O2Saturation),
            "8310-5" => Some(Self::Temperature),
            "11449-6" => Some(Self::Pregnancy),
            _ => None,
        }
    }

    /// The unit string(s) this kind requires, if any — used both to
    /// validate an observation and to report [`ClinicalResolution::InvalidUnits`].
    pub fn expected_units(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::Age => Some(&["Years"]),
            Self::O2Saturation => Some(&["Percent", "PercentOxygen[Volume Fraction Units]"]),
            Self::Temperature => Some(&["Degree Fahrenheit [Temperature]"]),
            Self::ChiefComplaint | Self::FluVaccine | Self::H1n1Vaccine | Self::Pregnancy => None,
        }
    }

    /// Apply this kind's transform to a raw observation, per the
    /// association table in §4.4. A unit mismatch on a kind that
    /// requires one is reported as [`ClinicalResolution::InvalidUnits`]
    /// (§7: "Invalid clinical units" is exceptional, worker rolls back
    /// the visit) — distinct from an unrecognized LOINC code, which is
    /// silently ignored one level up in the dispatcher.
    pub fn resolve(&self, obs: &ClinicalObservation) -> ClinicalResolution {
        if let Some(expected) = self.expected_units() {
            if !expected.contains(&obs.units.as_deref().unwrap_or("")) {
                return ClinicalResolution::InvalidUnits { expected, actual: obs.units.clone() };
            }
        }
        let value = match self {
            Self::ChiefComplaint => Some(ClinicalValue::Text(obs.result.clone())),
            Self::Age => obs.result.trim().parse::<i16>().ok().map(ClinicalValue::Age),
            Self::FluVaccine | Self::H1n1Vaccine => Some(ClinicalValue::Text(obs.result.clone())),
            Self::O2Saturation => {
                obs.result.trim_end_matches('.').parse::<i16>().ok().map(ClinicalValue::O2Percent)
            },
            Self::Temperature => obs
                .result
                .trim()
                .parse::<f64>()
                .ok()
                .map(|f| ClinicalValue::TemperatureF((f * 10.0).round() / 10.0)),
            Self::Pregnancy => {
                obs.result.split('|').nth(1).filter(|s| !s.is_empty()).map(|s| ClinicalValue::Text(s.to_string()))
            },
        };
        match value {
            Some(v) => ClinicalResolution::Value(v),
            None => ClinicalResolution::Unparseable,
        }
    }
}

/// The resolved, transformed value of a clinical observation, ready
/// to feed into its target dimension or visit column.
#[derive(Debug, Clone, PartialEq)]
pub enum ClinicalValue {
    Text(String),
    Age(i16),
    O2Percent(i16),
    TemperatureF(f64),
}

/// Outcome of [`ClinicalObservationKind::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClinicalResolution {
    Value(ClinicalValue),
    InvalidUnits { expected: &'static [&'static str], actual: Option<String> },
    Unparseable,
}

/// An accumulated diagnosis. Immutable after construction; equality
/// and hashing consider only `(icd9, status)` (§4.4).
#[derive(Debug, Clone)]
pub struct SurrogateDiagnosis {
    pub rank: i16,
    pub icd9: String,
    pub description: Option<String>,
    pub status: String,
    pub dx_datetime: Option<NaiveDateTime>,
}

impl PartialEq for SurrogateDiagnosis {
    fn eq(&self, other: &Self) -> bool {
        self.icd9 == other.icd9 && self.status == other.status
    }
}
impl Eq for SurrogateDiagnosis {}
impl std::hash::Hash for SurrogateDiagnosis {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.icd9.hash(state);
        self.status.hash(state);
    }
}

/// An accumulated lab result. Sealed once inserted into a
/// deduplicating set: `append_result`/`set_note` must only be called
/// pre-seal (§4.4, §9 "immutable-after-construction with hash caching").
///
/// Identity for deduplication is `(test_code, test_text, coding,
/// result, units, status)` — deliberately distinct from the
/// `lab_result` dimension's own identifying fields, which omit
/// `status` (a test/result pair may legitimately recur at a later
/// status such as preliminary-then-final).
#[derive(Debug, Clone)]
pub struct SurrogateLab {
    pub test_code: String,
    pub test_text: Option<String>,
    pub coding: Option<String>,
    pub result: String,
    pub units: Option<String>,
    pub status: String,
    pub abn_code: Option<String>,
    pub abn_text: Option<String>,
    pub abn_coding: Option<String>,
    pub collection_datetime: Option<NaiveDateTime>,
    pub report_datetime: Option<NaiveDateTime>,
    pub specimen_source: Option<String>,
    pub filler_order_no: Option<String>,
    pub performing_lab_code: Option<String>,
    pub reference_range: Option<String>,
    pub note: Option<String>,
    sealed: bool,
}

impl SurrogateLab {
    pub fn new(
        test_code: String,
        test_text: Option<String>,
        coding: Option<String>,
        result: String,
        units: Option<String>,
        status: String,
    ) -> Self {
        Self {
            test_code,
            test_text,
            coding,
            result,
            units,
            status,
            abn_code: None,
            abn_text: None,
            abn_coding: None,
            collection_datetime: None,
            report_datetime: None,
            specimen_source: None,
            filler_order_no: None,
            performing_lab_code: None,
            reference_range: None,
            note: None,
            sealed: false,
        }
    }

    /// Append to `result` before this lab has ever been placed into a
    /// dedup set. Panics in debug builds if called after sealing —
    /// mutating a field that participates in the identity tuple after
    /// it has been hashed would silently corrupt the set.
    pub fn append_result(&mut self, fragment: &str) {
        debug_assert!(!self.sealed, "append_result called on a sealed SurrogateLab");
        if fragment.is_empty() {
            return;
        }
        if self.result.is_empty() {
            self.result = fragment.to_string();
        } else {
            self.result.push(' ');
            self.result.push_str(fragment);
        }
    }

    /// Set the stitched note. Does not participate in the identity
    /// tuple, but is gated by the same seal for consistency.
    pub fn set_note(&mut self, note: String) {
        debug_assert!(!self.sealed, "set_note called on a sealed SurrogateLab");
        self.note = Some(truncate_to(&note, MAX_NOTE_LEN));
    }

    pub fn seal(mut self) -> Self {
        self.sealed = true;
        self
    }
}

impl PartialEq for SurrogateLab {
    fn eq(&self, other: &Self) -> bool {
        (&self.test_code, &self.test_text, &self.coding, &self.result, &self.units, &self.status)
            == (&other.test_code, &other.test_text, &other.coding, &other.result, &other.units, &other.status)
    }
}
impl Eq for SurrogateLab {}
impl std::hash::Hash for SurrogateLab {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.test_code.hash(state);
        self.test_text.hash(state);
        self.coding.hash(state);
        self.result.hash(state);
        self.units.hash(state);
        self.status.hash(state);
    }
}

/// True if `assigned_location`/`service_area` indicate an ICU stay
/// (§4.4 "derived rule — ever_in_icu").
fn indicates_icu(assigned_location: Option<&str>, service_area: Option<&str>) -> bool {
    let location_icu = assigned_location
        .map(|loc| loc.ends_with("ICU") || loc.ends_with("ACU") || loc == "ACUI")
        .unwrap_or(false);
    let area_icu = service_area.map(|area| area == "INT" || area == "PIN").unwrap_or(false);
    location_icu || area_icu
}

/// In-memory merge buffer for one `(visit_id, patient_class)`.
pub struct SurrogateVisit {
    /// `None` until persisted (a brand-new visit has no pk yet).
    pub pk: Option<i64>,
    pub visit_id: String,
    pub patient_class: String,
    pub patient_id: String,
    pub admit_datetime: Option<NaiveDateTime>,
    pub first_message: Option<NaiveDateTime>,
    pub last_message: Option<NaiveDateTime>,
    pub discharge_datetime: Option<NaiveDateTime>,
    pub dob: Option<NaiveDateTime>,
    pub gender: Option<String>,
    pub ever_in_icu: bool,

    /// NPI of the facility that admitted this visit, resolved to
    /// `dim_facility.pk` just before `fact_visit` is written (§4.5).
    pub facility_npi: Option<i64>,

    pub admission_source: Option<String>,
    pub assigned_location: Option<String>,
    pub admit_reason: Option<String>,
    pub chief_complaint: Option<String>,
    pub disposition: Option<i16>,
    pub country: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub race: Option<String>,
    pub service_area: Option<String>,

    pub diagnoses: HashSet<SurrogateDiagnosis>,
    pub labs: HashSet<SurrogateLab>,
    pub clinical: std::collections::HashMap<String, ClinicalObservation>,

    modified: bool,
}

impl SurrogateVisit {
    pub fn new(visit_id: String, patient_class: String, patient_id: String) -> Self {
        Self {
            pk: None,
            visit_id,
            patient_class,
            patient_id,
            admit_datetime: None,
            first_message: None,
            last_message: None,
            discharge_datetime: None,
            dob: None,
            gender: None,
            ever_in_icu: false,
            facility_npi: None,
            admission_source: None,
            assigned_location: None,
            admit_reason: None,
            chief_complaint: None,
            disposition: None,
            country: None,
            county: None,
            state: None,
            zip: None,
            race: None,
            service_area: None,
            diagnoses: HashSet::new(),
            labs: HashSet::new(),
            clinical: std::collections::HashMap::new(),
            modified: true,
        }
    }

    pub fn from_existing(visit: &Visit) -> Self {
        Self {
            pk: Some(visit.pk),
            visit_id: visit.visit_id.clone(),
            patient_class: visit.patient_class.clone(),
            patient_id: visit.patient_id.clone(),
            admit_datetime: Some(visit.admit_datetime),
            first_message: Some(visit.first_message),
            last_message: Some(visit.last_message),
            discharge_datetime: visit.discharge_datetime,
            dob: visit.dob,
            gender: Some(visit.gender.clone()),
            ever_in_icu: visit.ever_in_icu,
            // Already resolved and persisted; only needed again for a
            // brand-new visit row.
            facility_npi: None,
            admission_source: None,
            assigned_location: None,
            admit_reason: None,
            chief_complaint: None,
            disposition: None,
            country: None,
            county: None,
            state: None,
            zip: None,
            race: None,
            service_area: None,
            diagnoses: HashSet::new(),
            labs: HashSet::new(),
            clinical: std::collections::HashMap::new(),
            modified: false,
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    /// "Last non-empty wins" — a setter template shared by every
    /// scalar field (§4.4).
    fn set_if_present<T>(slot: &mut Option<T>, value: Option<T>, modified: &mut bool) {
        if let Some(v) = value {
            *slot = Some(v);
            *modified = true;
        }
    }

    pub fn set_admit_datetime(&mut self, v: Option<NaiveDateTime>) {
        Self::set_if_present(&mut self.admit_datetime, v, &mut self.modified);
    }
    pub fn set_discharge_datetime(&mut self, v: Option<NaiveDateTime>) {
        Self::set_if_present(&mut self.discharge_datetime, v, &mut self.modified);
    }
    pub fn set_gender(&mut self, v: Option<String>) {
        Self::set_if_present(&mut self.gender, v.filter(|s| !s.is_empty()), &mut self.modified);
    }
    pub fn set_dob(&mut self, v: Option<NaiveDateTime>) {
        Self::set_if_present(&mut self.dob, v, &mut self.modified);
    }
    pub fn set_disposition(&mut self, v: Option<i16>) {
        Self::set_if_present(&mut self.disposition, v, &mut self.modified);
    }
    pub fn set_facility_npi(&mut self, v: Option<i64>) {
        Self::set_if_present(&mut self.facility_npi, v, &mut self.modified);
    }

    pub fn set_admission_source(&mut self, v: Option<String>) {
        Self::set_if_present(&mut self.admission_source, v.filter(|s| !s.is_empty()), &mut self.modified);
    }

    /// Also drives the `ever_in_icu` side effect.
    pub fn set_assigned_location(&mut self, v: Option<String>) {
        if let Some(loc) = v.filter(|s| !s.is_empty()) {
            if indicates_icu(Some(&loc), self.service_area.as_deref()) {
                self.ever_in_icu = true;
            }
            self.assigned_location = Some(loc);
            self.modified = true;
        }
    }

    pub fn set_chief_complaint(&mut self, v: Option<String>) {
        if let Some(cc) = v.filter(|s| !s.is_empty()) {
            self.admit_reason = Some(cc.clone());
            self.chief_complaint = Some(cc);
            self.modified = true;
        }
    }

    pub fn set_race(&mut self, v: Option<String>) {
        Self::set_if_present(&mut self.race, v.filter(|s| !s.is_empty()), &mut self.modified);
    }

    /// Also drives the `ever_in_icu` side effect.
    pub fn set_service_area(&mut self, v: Option<String>) {
        if let Some(area) = v.filter(|s| !s.is_empty()) {
            if indicates_icu(self.assigned_location.as_deref(), Some(&area)) {
                self.ever_in_icu = true;
            }
            self.service_area = Some(area);
            self.modified = true;
        }
    }

    pub fn set_location(&mut self, country: Option<String>, county: Option<String>, state: Option<String>, zip: Option<String>) {
        let any = country.is_some() || county.is_some() || state.is_some() || zip.is_some();
        if !any {
            return;
        }
        Self::set_if_present(&mut self.country, country, &mut self.modified);
        Self::set_if_present(&mut self.county, county, &mut self.modified);
        Self::set_if_present(&mut self.state, state, &mut self.modified);
        Self::set_if_present(&mut self.zip, zip, &mut self.modified);
    }

    pub fn add_diagnosis(&mut self, dx: SurrogateDiagnosis) {
        if dx.icd9.is_empty() {
            return;
        }
        self.diagnoses.insert(dx);
        self.modified = true;
    }

    pub fn add_lab(&mut self, lab: SurrogateLab) {
        self.labs.insert(lab);
        self.modified = true;
    }

    /// Store the first non-empty `(result, units)` pair seen for
    /// `loinc_code`, excluding [`EXCLUDED_OBSERVATION_CODE`] and any
    /// code outside [`CLINICAL_LOINC_CODES`].
    pub fn add_clinical_observation(&mut self, loinc_code: &str, result: &str, units: Option<String>) {
        if loinc_code == EXCLUDED_OBSERVATION_CODE {
            return;
        }
        if !CLINICAL_LOINC_CODES.contains(&loinc_code) {
            return;
        }
        if result.is_empty() {
            return;
        }
        self.clinical
            .entry(loinc_code.to_string())
            .or_insert_with(|| ClinicalObservation { result: result.to_string(), units });
    }

    /// Extend the message-timestamp window for no-class messages that
    /// apply to every surrogate (§4.5 step 8).
    pub fn extend_message_window(&mut self, dt: NaiveDateTime) {
        self.first_message = Some(self.first_message.map_or(dt, |f| f.min(dt)));
        self.last_message = Some(self.last_message.map_or(dt, |l| l.max(dt)));
    }

    /// Compute age from `dob`/`admit_datetime` when not already set,
    /// clamping any negative result to 0 (§4.5 step 8 — broader than
    /// the original's exact `-1 -> 0` special case).
    pub fn ensure_age(&self) -> Option<i16> {
        let dob = self.dob?;
        let admit = self.admit_datetime?;
        let years = admit.date().years_since(dob.date())? as i64;
        Some(years.max(0) as i16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn scalar_setter_keeps_last_non_empty() {
        let mut v = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        v.set_gender(Some("F".into()));
        v.set_gender(None);
        assert_eq!(v.gender, Some("F".into()));
        v.set_gender(Some("M".into()));
        assert_eq!(v.gender, Some("M".into()));
    }

    #[test]
    fn assigned_location_ending_in_icu_sets_flag() {
        let mut v = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        v.set_assigned_location(Some("EDACU".into()));
        assert!(v.ever_in_icu);
    }

    #[test]
    fn service_area_int_sets_flag_and_is_monotone() {
        let mut v = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        v.set_service_area(Some("INT".into()));
        assert!(v.ever_in_icu);
        v.set_assigned_location(Some("WARD3".into()));
        assert!(v.ever_in_icu, "ever_in_icu must not clear once set");
    }

    #[test]
    fn diagnosis_identity_ignores_rank_and_description() {
        let a = SurrogateDiagnosis { rank: 1, icd9: "250.00".into(), description: Some("diabetes".into()), status: "F".into(), dx_datetime: None };
        let b = SurrogateDiagnosis { rank: 2, icd9: "250.00".into(), description: None, status: "F".into(), dx_datetime: Some(dt(2020, 1, 1)) };
        assert_eq!(a, b);
    }

    #[test]
    fn lab_identity_includes_status_unlike_dimension_identity() {
        let prelim = SurrogateLab::new("GLU".into(), None, None, "100".into(), None, "P".into());
        let final_ = SurrogateLab::new("GLU".into(), None, None, "100".into(), None, "F".into());
        assert_ne!(prelim, final_);
    }

    #[test]
    fn clinical_observation_keeps_first_non_empty_only() {
        let mut v = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        v.add_clinical_observation("8310-5", "98.6", Some("Degree Fahrenheit [Temperature]".into()));
        v.add_clinical_observation("8310-5", "99.1", Some("Degree Fahrenheit [Temperature]".into()));
        assert_eq!(v.clinical["8310-5"].result, "98.6");
    }

    #[test]
    fn excluded_observation_code_is_never_stored() {
        let mut v = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        v.add_clinical_observation("43140-3", "something", None);
        assert!(!v.clinical.contains_key("43140-3"));
    }

    #[test]
    fn age_computation_clamps_negative_to_zero() {
        let mut v = SurrogateVisit::new("V1".into(), "E".into(), "P1".into());
        v.dob = Some(dt(2024, 1, 1));
        v.admit_datetime = Some(dt(2020, 1, 1));
        assert_eq!(v.ensure_age(), Some(0));
    }

    #[test]
    fn pregnancy_kind_takes_second_pipe_subfield() {
        // `resolve` runs downstream of `strip_xml` on the production
        // path, which turns component-XML into pipe-joined text — the
        // fixture here is already in that post-strip form.
        let kind = ClinicalObservationKind::for_code("11449-6").unwrap();
        let obs = ClinicalObservation { result: "A|pos|B".into(), units: None };
        assert_eq!(kind.resolve(&obs), ClinicalResolution::Value(ClinicalValue::Text("pos".into())));
    }

    #[test]
    fn temperature_kind_rounds_to_one_decimal() {
        let kind = ClinicalObservationKind::for_code("8310-5").unwrap();
        let obs = ClinicalObservation {
            result: "98.47".into(),
            units: Some("Degree Fahrenheit [Temperature]".into()),
        };
        assert_eq!(kind.resolve(&obs), ClinicalResolution::Value(ClinicalValue::TemperatureF(98.5)));
    }

    #[test]
    fn temperature_kind_requires_matching_units() {
        let kind = ClinicalObservationKind::for_code("8310-5").unwrap();
        let obs = ClinicalObservation { result: "98.47".into(), units: Some("Celsius".into()) };
        assert!(matches!(kind.resolve(&obs), ClinicalResolution::InvalidUnits { .. }));
    }

    #[test]
    fn o2_saturation_trims_trailing_dot() {
        let kind = ClinicalObservationKind::for_code("20564-1").unwrap();
        let obs = ClinicalObservation { result: "98.".into(), units: Some("Percent".into()) };
        assert_eq!(kind.resolve(&obs), ClinicalResolution::Value(ClinicalValue::O2Percent(98)));
    }

    #[test]
    fn age_kind_requires_years_units() {
        let kind = ClinicalObservationKind::for_code("29553-5").unwrap();
        let wrong_units = ClinicalObservation { result: "42".into(), units: Some("Months".into()) };
        assert!(matches!(kind.resolve(&wrong_units), ClinicalResolution::InvalidUnits { .. }));
        let right_units = ClinicalObservation { result: "42".into(), units: Some("Years".into()) };
        assert_eq!(kind.resolve(&right_units), ClinicalResolution::Value(ClinicalValue::Age(42)));
    }

    #[test]
    fn unrecognized_code_yields_no_kind() {
        assert_eq!(ClinicalObservationKind::for_code("99999-9"), None);
    }
}
