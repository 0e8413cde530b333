//! Static-data import/export (C8, §4.8): bootstraps mart dimensions
//! that have no upstream HL7 source — `facility`, `admission_source`,
//! `disposition`, `reportable_region` — from a YAML file.
//!
//! The original (`static_data.py`) serializes live ORM instances under
//! a custom `!DAO` YAML tag whose loader calls `eval()` on the tag
//! body to reconstruct them (guarded only by an `isinstance` check
//! after the fact). This build replaces that with an ordinary
//! `serde`-tagged enum of plain row shapes — no dynamic code execution
//! is possible by construction.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::dimension::{AdmissionSourceCandidate, DispositionCandidate, FacilityCandidate};
use crate::error::StaticDataError;
use crate::locks::DimensionLocks;
use crate::models::mart::{AdmissionSourceRow, DispositionRow, FacilityRow};
use crate::select_or_insert::fetch;

/// One row of one of the four supported static-data tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table")]
pub enum StaticRow {
    Facility {
        npi: i64,
        local_code: String,
        organization_name: String,
        zip: String,
        county: String,
    },
    AdmissionSource {
        code: String,
        description: Option<String>,
    },
    Disposition {
        code: i16,
        gipse_mapping: Option<String>,
        odin_mapping: Option<String>,
        description: Option<String>,
    },
    /// References a facility by NPI rather than by the mart's
    /// synthetic `dim_facility.pk`, since NPI is the stable,
    /// human-assigned identifier a config file should carry (§4.8:
    /// "must follow facility" — the load order below resolves NPI to
    /// pk before this variant's insert).
    ReportableRegion {
        region_name: String,
        facility_npi: i64,
    },
}

/// Serialize the four supported tables' rows to one YAML document
/// (§4.8 `dump()`).
pub async fn dump(mart: &PgPool) -> Result<String, StaticDataError> {
    let mut rows = Vec::new();

    let facilities: Vec<FacilityRow> = sqlx::query_as("SELECT * FROM dim_facility ORDER BY pk").fetch_all(mart).await?;
    for f in facilities {
        rows.push(StaticRow::Facility {
            npi: f.npi,
            local_code: f.local_code,
            organization_name: f.organization_name,
            zip: f.zip,
            county: f.county,
        });
    }

    let sources: Vec<AdmissionSourceRow> = sqlx::query_as("SELECT * FROM dim_admission_source ORDER BY code").fetch_all(mart).await?;
    for s in sources {
        rows.push(StaticRow::AdmissionSource { code: s.code, description: Some(s.description) });
    }

    let dispositions: Vec<DispositionRow> = sqlx::query_as("SELECT * FROM dim_disposition ORDER BY code").fetch_all(mart).await?;
    for d in dispositions {
        rows.push(StaticRow::Disposition {
            code: d.code,
            gipse_mapping: Some(d.gipse_mapping),
            odin_mapping: Some(d.odin_mapping),
            description: Some(d.description),
        });
    }

    let regions: Vec<(String, i64)> = sqlx::query_as(
        "SELECT rr.region_name, f.npi FROM reportable_region rr JOIN dim_facility f ON f.pk = rr.dim_facility_pk \
         ORDER BY rr.region_name",
    )
    .fetch_all(mart)
    .await?;
    for (region_name, facility_npi) in regions {
        rows.push(StaticRow::ReportableRegion { region_name, facility_npi });
    }

    serde_yaml::to_string(&rows).map_err(StaticDataError::Serialize)
}

/// Parse and load a YAML document produced by [`dump`] (or hand
/// authored for bootstrapping), upserting each row through the
/// select-or-insert primitive so a re-run is idempotent.
///
/// Load order is fixed: facilities, admission sources, and
/// dispositions carry no foreign keys among them and may load in any
/// order relative to each other, but `ReportableRegion` references
/// `dim_facility` and must load last (§4.8).
pub async fn load(mart: &PgPool, locks: &DimensionLocks, yaml: &str) -> Result<(), StaticDataError> {
    let rows: Vec<StaticRow> =
        serde_yaml::from_str(yaml).map_err(|source| StaticDataError::Parse { path: "<input>".to_string(), source })?;

    // `facility` sees no concurrent worker traffic (it is bootstrapped
    // ahead of a run, per `DimensionLocks`'s doc comment), so this
    // load uses a lock private to the one-shot CLI invocation rather
    // than borrowing a worker lock that means something else.
    let facility_lock = Mutex::new(());

    let mut regions = Vec::new();
    for row in rows {
        match row {
            StaticRow::Facility { npi, local_code, organization_name, zip, county } => {
                fetch::<FacilityRow>(mart, &facility_lock, FacilityCandidate { npi, local_code, organization_name, zip, county })
                    .await
                    .map_err(StaticDataError::Dimension)?;
            },
            StaticRow::AdmissionSource { code, description } => {
                fetch::<AdmissionSourceRow>(mart, &locks.admission_source, AdmissionSourceCandidate { code, description })
                    .await
                    .map_err(StaticDataError::Dimension)?;
            },
            StaticRow::Disposition { code, gipse_mapping, odin_mapping, description } => {
                fetch::<DispositionRow>(
                    mart,
                    &locks.disposition,
                    DispositionCandidate { code, gipse_mapping, odin_mapping, description },
                )
                .await
                .map_err(StaticDataError::Dimension)?;
            },
            StaticRow::ReportableRegion { region_name, facility_npi } => {
                regions.push((region_name, facility_npi));
            },
        }
    }

    for (region_name, facility_npi) in regions {
        let facility: (i64,) = sqlx::query_as("SELECT pk FROM dim_facility WHERE npi = $1")
            .bind(facility_npi)
            .fetch_one(mart)
            .await
            .map_err(StaticDataError::Database)?;
        sqlx::query(
            "INSERT INTO reportable_region (region_name, dim_facility_pk) VALUES ($1, $2) \
             ON CONFLICT (region_name, dim_facility_pk) DO NOTHING",
        )
        .bind(&region_name)
        .bind(facility.0)
        .execute(mart)
        .await
        .map_err(StaticDataError::Database)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_yaml() {
        let rows = vec![
            StaticRow::Facility {
                npi: 10987,
                local_code: "ABC".to_string(),
                organization_name: "Test Hospital".to_string(),
                zip: "98101".to_string(),
                county: "King".to_string(),
            },
            StaticRow::ReportableRegion { region_name: "test_region".to_string(), facility_npi: 10987 },
        ];
        let yaml = serde_yaml::to_string(&rows).unwrap();
        let reparsed: Vec<StaticRow> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed.len(), 2);
        assert!(matches!(reparsed[0], StaticRow::Facility { npi: 10987, .. }));
    }
}
