//! Lab-segment state machine (C3, §4.3).
//!
//! Reconstructs discrete lab results from a stream of `(OBR, OBX[])`
//! pairs. A single logical result can span several OBX rows tagged
//! with a continuation sub-id (OBX-4.1); this module groups rows into
//! [`PendingLab`]s using the same boundary rules the observation
//! stream was originally written against.

use crate::error::LabStateMachineError;
use crate::models::warehouse::{NoteRow, Obx, ObservationRequest};
use crate::xml_strip::strip_xml;

/// Parsed OBX-4.1 sub-id, e.g. `""`, `"1"`, `"1.2"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObxSequence {
    pub whole: Option<u32>,
    pub frac: Option<u32>,
}

impl ObxSequence {
    /// `None`/empty input parses to a fully-undefined sequence.
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw {
            Some(s) if !s.trim().is_empty() => s.trim(),
            _ => return Self::default(),
        };
        let mut parts = raw.splitn(2, '.');
        let whole = parts.next().and_then(|w| w.parse::<u32>().ok());
        let frac = parts.next().and_then(|f| f.parse::<u32>().ok());
        Self { whole, frac }
    }

    /// True iff `self` logically continues into `next` (§4.3):
    /// same whole part with an advancing fraction, or an advancing
    /// whole part with an equal fraction. `Some(0)` counts as defined
    /// (see SPEC_FULL.md §9 on the frac=0 decision).
    pub fn in_sequence_with(&self, next: &ObxSequence) -> bool {
        match (self.frac, next.frac) {
            (Some(a), Some(b)) => {
                (self.whole == next.whole && a < b) || (self.whole < next.whole && a == b)
            },
            _ => false,
        }
    }
}

/// A lab result still being assembled from one or more OBX rows.
#[derive(Debug, Clone)]
pub struct PendingLab {
    pub test_code: String,
    pub test_text: Option<String>,
    pub coding: Option<String>,
    pub result: String,
    pub result_unit: Option<String>,
    pub abn_code: Option<String>,
    pub abn_text: Option<String>,
    pub abn_coding: Option<String>,
    pub collection_datetime: Option<chrono::NaiveDateTime>,
    pub report_datetime: Option<chrono::NaiveDateTime>,
    pub specimen_source: Option<String>,
    pub filler_order_no: Option<String>,
    pub performing_lab_code: Option<String>,
    pub reference_range: Option<String>,
    pub note: Option<String>,
    /// Carried from the originating OBR's `status` (HL7 OBR-25); the
    /// surrogate's `status ∈ {P,A,F,X}` identity field (§4.4, §3.2).
    pub status: Option<String>,
    pub contributing_obr_ids: Vec<i64>,
    pub contributing_obx_ids: Vec<i64>,
}

impl PendingLab {
    fn append_result(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        if self.result.is_empty() {
            self.result = fragment.to_string();
        } else {
            self.result.push(' ');
            self.result.push_str(fragment);
        }
        self.result = crate::models::mart::truncate_to(&self.result, crate::models::mart::MAX_RESULT_LEN);
    }
}

#[derive(Debug, Default)]
struct MachineState {
    active_index: usize,
    active_lab_set: bool,
    last_sequence: ObxSequence,
    last_code: String,
}

impl MachineState {
    fn on_new_obr(&mut self) {
        if self.active_lab_set {
            self.active_index += 1;
            self.active_lab_set = false;
            self.last_sequence = ObxSequence::default();
        }
    }

    fn on_new_obx(&mut self, sequence: ObxSequence, code: &str) {
        if self.active_lab_set && (code != self.last_code || !self.last_sequence.in_sequence_with(&sequence)) {
            self.active_index += 1;
            self.active_lab_set = false;
            self.last_sequence = ObxSequence::default();
        }
        self.last_sequence = sequence;
        self.active_lab_set = true;
        self.last_code = code.to_string();
    }
}

/// Pick the first defined (code, text, coding) triple from the
/// primary/alternate pair carried by an OBX row, falling back to the
/// parent OBR's loinc/alt code when the OBX itself carries none
/// (§4.3 "preferred code selection").
fn preferred_code(obx: &Obx, obr: &ObservationRequest) -> Option<(String, Option<String>, Option<String>)> {
    if let Some(id) = obx.observation_id.as_ref().filter(|s| !s.is_empty()) {
        return Some((id.clone(), obx.observation_text.clone(), obx.coding.clone()));
    }
    if let Some(id) = obx.alt_id.as_ref().filter(|s| !s.is_empty()) {
        return Some((id.clone(), obx.alt_text.clone(), obx.alt_coding.clone()));
    }
    if let Some(id) = obr.loinc_code.as_ref().filter(|s| !s.is_empty()) {
        return Some((id.clone(), obr.loinc_text.clone(), obr.coding.clone()));
    }
    if let Some(id) = obr.alt_code.as_ref().filter(|s| !s.is_empty()) {
        return Some((id.clone(), obr.alt_text.clone(), obr.alt_coding.clone()));
    }
    None
}

/// Primary abnormality flag if any field is set, else the alternate
/// set, else none (§4.3 "preferred lab flag").
fn preferred_flag(obx: &Obx) -> (Option<String>, Option<String>, Option<String>) {
    if obx.abn_code.is_some() || obx.abn_text.is_some() || obx.abn_coding.is_some() {
        (obx.abn_code.clone(), obx.abn_text.clone(), obx.abn_coding.clone())
    } else if obx.alt_abn_code.is_some() || obx.alt_abn_text.is_some() || obx.alt_abn_coding.is_some() {
        (obx.alt_abn_code.clone(), obx.alt_abn_text.clone(), obx.alt_abn_coding.clone())
    } else {
        (None, None, None)
    }
}

/// Run the state machine over a message's observation-request stream,
/// emitting one [`PendingLab`] per logical result.
///
/// `pairs` is ordered `(obr, obx[])` the same way the warehouse
/// enumerates them: by `observation_datetime` then OBR insertion
/// order, OBX rows within an OBR in OBX-1 order.
///
/// Fails the whole reconstruction if any OBX carries no identifiable
/// code on either itself or its parent OBR (§4.3 "preferred code
/// selection" — "fail the lab if none is defined"); the caller's
/// visit-level transaction is rolled back and retried next run rather
/// than silently dropping the OBX pair.
pub fn reconstruct_labs(pairs: &[(ObservationRequest, Vec<Obx>)]) -> Result<Vec<PendingLab>, LabStateMachineError> {
    let mut state = MachineState::default();
    let mut labs: Vec<PendingLab> = Vec::new();

    for (obr, obxes) in pairs {
        state.on_new_obr();
        for obx in obxes {
            let Some((code, text, coding)) = preferred_code(obx, obr) else {
                return Err(LabStateMachineError::NoCodeDefined { obr_id: obr.obr_id, obx_id: obx.obx_id });
            };
            let sequence = ObxSequence::parse(obx.sequence.as_deref());
            state.on_new_obx(sequence, &code);

            let fragment = strip_xml(obx.observation_result.as_deref());
            let (abn_code, abn_text, abn_coding) = preferred_flag(obx);

            if state.active_index == labs.len() {
                labs.push(PendingLab {
                    test_code: code,
                    test_text: text,
                    coding,
                    result: String::new(),
                    result_unit: obx.units.clone(),
                    abn_code,
                    abn_text,
                    abn_coding,
                    collection_datetime: obr.observation_datetime,
                    report_datetime: obr.report_datetime,
                    specimen_source: obr.specimen_source.clone(),
                    filler_order_no: obr.filler_order_no.clone(),
                    performing_lab_code: obx.performing_lab_code.clone(),
                    reference_range: obx.reference_range.clone(),
                    note: None,
                    status: obr.status.clone(),
                    contributing_obr_ids: vec![obr.obr_id],
                    contributing_obx_ids: Vec::new(),
                });
            }

            let lab = &mut labs[state.active_index];
            lab.append_result(&fragment);
            lab.contributing_obx_ids.push(obx.obx_id);
            if !lab.contributing_obr_ids.contains(&obr.obr_id) {
                lab.contributing_obr_ids.push(obr.obr_id);
            }
        }
    }

    Ok(labs)
}

/// Stitch warehouse `NTE` notes onto the labs they were attached to
/// (§4.3 "note stitching"). `notes` should already be ordered by
/// `(obr_id, obx_id, sequence_number)`.
pub fn attach_notes(labs: &mut [PendingLab], notes: &[NoteRow]) {
    for note in notes {
        let target = if let Some(obx_id) = note.obx_id {
            labs.iter_mut().find(|l| l.contributing_obx_ids.contains(&obx_id))
        } else if let Some(obr_id) = note.obr_id {
            labs.iter_mut().find(|l| l.contributing_obr_ids.contains(&obr_id))
        } else {
            None
        };
        if let Some(lab) = target {
            let joined = match lab.note.take() {
                Some(existing) => format!("{existing} {}", note.note),
                None => note.note.clone(),
            };
            lab.note = Some(crate::models::mart::truncate_to(&joined, crate::models::mart::MAX_NOTE_LEN));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obr(obr_id: i64, loinc_code: &str) -> ObservationRequest {
        ObservationRequest {
            obr_id,
            msh_id: 1,
            observation_datetime: None,
            report_datetime: None,
            status: None,
            loinc_code: Some(loinc_code.to_string()),
            loinc_text: None,
            alt_code: None,
            alt_text: None,
            coding: None,
            alt_coding: None,
            specimen_source: None,
            filler_order_no: None,
        }
    }

    fn obx(obx_id: i64, sequence: Option<&str>, result: &str) -> Obx {
        Obx {
            obx_id,
            obr_id: Some(1),
            msh_id: 1,
            observation_id: Some("GLU".to_string()),
            observation_text: Some("Glucose".to_string()),
            coding: Some("LN".to_string()),
            alt_id: None,
            alt_text: None,
            alt_coding: None,
            observation_result: Some(result.to_string()),
            units: Some("mg/dL".to_string()),
            sequence: sequence.map(String::from),
            result_status: None,
            reference_range: None,
            performing_lab_code: None,
            abn_code: None,
            abn_text: None,
            abn_coding: None,
            alt_abn_code: None,
            alt_abn_text: None,
            alt_abn_coding: None,
        }
    }

    #[test]
    fn null_sequences_with_same_code_produce_two_labs() {
        let pairs = vec![(obr(1, "GLU"), vec![obx(1, None, "100"), obx(2, None, "110")])];
        let labs = reconstruct_labs(&pairs).unwrap();
        assert_eq!(labs.len(), 2);
    }

    #[test]
    fn continuation_sequence_merges_into_one_lab() {
        let pairs = vec![(obr(1, "GLU"), vec![obx(1, Some("1.1"), "part-a"), obx(2, Some("1.2"), "part-b")])];
        let labs = reconstruct_labs(&pairs).unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].result, "part-a part-b");
    }

    #[test]
    fn advancing_whole_with_equal_frac_continues() {
        let pairs = vec![(obr(1, "GLU"), vec![obx(1, Some("1.1"), "a"), obx(2, Some("2.1"), "b")])];
        let labs = reconstruct_labs(&pairs).unwrap();
        assert_eq!(labs.len(), 1);
    }

    #[test]
    fn non_advancing_sequence_starts_new_lab() {
        let pairs = vec![(obr(1, "GLU"), vec![obx(1, Some("1.1"), "a"), obx(2, Some("1"), "b")])];
        let labs = reconstruct_labs(&pairs).unwrap();
        assert_eq!(labs.len(), 2);
    }

    #[test]
    fn obr_boundary_bumps_index_only_if_prior_obr_emitted() {
        let pairs = vec![
            (obr(1, "GLU"), vec![obx(1, None, "100")]),
            (obr(2, "NA"), vec![obx(2, None, "140")]),
        ];
        let labs = reconstruct_labs(&pairs).unwrap();
        assert_eq!(labs.len(), 2);
    }

    #[test]
    fn missing_code_on_obx_and_obr_fails_the_lab() {
        let mut no_code_obx = obx(1, None, "100");
        no_code_obx.observation_id = None;
        no_code_obx.alt_id = None;
        let mut no_code_obr = obr(1, "GLU");
        no_code_obr.loinc_code = None;
        no_code_obr.alt_code = None;
        let pairs = vec![(no_code_obr, vec![no_code_obx])];
        let err = reconstruct_labs(&pairs).unwrap_err();
        assert!(matches!(err, LabStateMachineError::NoCodeDefined { obr_id: 1, obx_id: 1 }));
    }

    #[test]
    fn sequence_parse_treats_zero_fraction_as_defined() {
        let seq = ObxSequence::parse(Some("1.0"));
        assert_eq!(seq, ObxSequence { whole: Some(1), frac: Some(0) });
        let next = ObxSequence::parse(Some("1.1"));
        assert!(seq.in_sequence_with(&next));
    }

    #[test]
    fn empty_sequence_is_fully_undefined() {
        let seq = ObxSequence::parse(Some(""));
        assert_eq!(seq, ObxSequence::default());
        assert!(!seq.in_sequence_with(&seq));
    }

    #[test]
    fn notes_attach_by_obx_id_before_obr_id() {
        let pairs = vec![(obr(1, "GLU"), vec![obx(1, None, "100")])];
        let mut labs = reconstruct_labs(&pairs).unwrap();
        let notes = vec![NoteRow { obr_id: None, obx_id: Some(1), sequence_number: 0, note: "hemolyzed".to_string() }];
        attach_notes(&mut labs, &notes);
        assert_eq!(labs[0].note.as_deref(), Some("hemolyzed"));
    }
}
