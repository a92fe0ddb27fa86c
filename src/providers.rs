// External data providers
//
// Four seams to the outside world: the owner's member roster, the registered
// person/persona map, the owner's ledger feed, and a name lookup for ids the
// feed mentions. Each seam is a trait so the engine can run against CSV
// exports, a live upstream, or in-memory fixtures without caring which.
//
// Provider failures are upstream problems, not domain problems, so these
// traits speak anyhow::Result; the engine wraps them at the boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::db::LedgerEntry;

// ============================================================================
// RECORDS
// ============================================================================

/// One persona on an owner's roster, as the upstream reports it. The name
/// may be blank; the directory fills it in through the identity lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterMember {
    pub persona_id: i64,
    pub name: String,
    pub joined: Option<DateTime<Utc>>,
}

/// A registered person and every persona they control. `personas` includes
/// the main. `organization_id` is where the main persona currently sits,
/// when the upstream knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub person_id: i64,
    pub main_persona_id: i64,
    pub main_name: String,
    pub organization_id: Option<i64>,
    pub personas: Vec<i64>,
}

impl PersonRecord {
    pub fn controls(&self, persona_id: i64) -> bool {
        self.personas.contains(&persona_id)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Source of an owner's current member roster.
pub trait RosterProvider {
    fn fetch_roster(&self) -> Result<Vec<RosterMember>>;
}

/// Source of the registered person/persona map.
pub trait PersonaSetProvider {
    fn fetch_people(&self) -> Result<Vec<PersonRecord>>;
}

/// Source of an owner's raw ledger entries.
pub trait LedgerFeed {
    fn fetch_entries(&self) -> Result<Vec<LedgerEntry>>;
}

/// Resolves external ids to display names. Batched: one call per import or
/// sync, never one call per id.
pub trait IdentityLookup {
    fn lookup_names(&self, ids: &[i64]) -> Result<HashMap<i64, String>>;
}

// ============================================================================
// CSV ADAPTERS
// ============================================================================

/// Roster CSV: persona_id,name,joined
/// joined is RFC3339 or blank.
pub struct CsvRosterFile {
    path: PathBuf,
}

impl CsvRosterFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvRosterFile { path: path.into() }
    }
}

impl RosterProvider for CsvRosterFile {
    fn fetch_roster(&self) -> Result<Vec<RosterMember>> {
        let mut reader = open_csv(&self.path)?;
        let mut members = Vec::new();

        for (line_num, result) in reader.records().enumerate() {
            let line = line_num + 2;
            let record = result
                .with_context(|| format!("Failed to read line {} of {}", line, self.path.display()))?;

            members.push(RosterMember {
                persona_id: parse_i64(&record, 0, line, "persona id")?,
                name: field(&record, 1).to_string(),
                joined: parse_opt_date(field(&record, 2), line)?,
            });
        }

        Ok(members)
    }
}

/// Person/persona CSV: person_id,main_persona_id,main_name,organization_id,personas
/// organization_id may be blank; personas is a semicolon-separated id list.
pub struct CsvPersonaFile {
    path: PathBuf,
}

impl CsvPersonaFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvPersonaFile { path: path.into() }
    }
}

impl PersonaSetProvider for CsvPersonaFile {
    fn fetch_people(&self) -> Result<Vec<PersonRecord>> {
        let mut reader = open_csv(&self.path)?;
        let mut people = Vec::new();

        for (line_num, result) in reader.records().enumerate() {
            let line = line_num + 2;
            let record = result
                .with_context(|| format!("Failed to read line {} of {}", line, self.path.display()))?;

            let org_raw = field(&record, 3);
            let organization_id = if org_raw.is_empty() {
                None
            } else {
                Some(parse_i64(&record, 3, line, "organization id")?)
            };

            let mut personas = Vec::new();
            for part in field(&record, 4).split(';') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let id = part
                    .parse::<i64>()
                    .with_context(|| format!("Invalid persona id '{}' on line {}", part, line))?;
                personas.push(id);
            }

            let main_persona_id = parse_i64(&record, 1, line, "main persona id")?;
            if !personas.contains(&main_persona_id) {
                personas.push(main_persona_id);
            }

            people.push(PersonRecord {
                person_id: parse_i64(&record, 0, line, "person id")?,
                main_persona_id,
                main_name: field(&record, 2).to_string(),
                organization_id,
                personas,
            });
        }

        Ok(people)
    }
}

/// Ledger CSV: entry_id,first_party_id,second_party_id,amount,date,reason,entry_type
/// date is RFC3339; amount is an integer in the smallest currency unit.
pub struct CsvLedgerFile {
    path: PathBuf,
}

impl CsvLedgerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvLedgerFile { path: path.into() }
    }
}

impl LedgerFeed for CsvLedgerFile {
    fn fetch_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut reader = open_csv(&self.path)?;
        let mut entries = Vec::new();

        for (line_num, result) in reader.records().enumerate() {
            let line = line_num + 2;
            let record = result
                .with_context(|| format!("Failed to read line {} of {}", line, self.path.display()))?;

            entries.push(LedgerEntry {
                entry_id: parse_i64(&record, 0, line, "entry id")?,
                first_party_id: parse_i64(&record, 1, line, "first party id")?,
                second_party_id: parse_i64(&record, 2, line, "second party id")?,
                amount: parse_i64(&record, 3, line, "amount")?,
                date: parse_date(field(&record, 4), line)?,
                reason: field(&record, 5).to_string(),
                entry_type: field(&record, 6).to_string(),
            });
        }

        Ok(entries)
    }
}

/// Name CSV: id,name. Serves lookups from a local export instead of a live
/// identity service.
pub struct CsvNameFile {
    path: PathBuf,
}

impl CsvNameFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CsvNameFile { path: path.into() }
    }
}

impl IdentityLookup for CsvNameFile {
    fn lookup_names(&self, ids: &[i64]) -> Result<HashMap<i64, String>> {
        let mut reader = open_csv(&self.path)?;
        let mut known = HashMap::new();

        for (line_num, result) in reader.records().enumerate() {
            let line = line_num + 2;
            let record = result
                .with_context(|| format!("Failed to read line {} of {}", line, self.path.display()))?;
            known.insert(
                parse_i64(&record, 0, line, "id")?,
                field(&record, 1).to_string(),
            );
        }

        Ok(ids
            .iter()
            .filter_map(|id| known.get(id).map(|name| (*id, name.clone())))
            .collect())
    }
}

// ============================================================================
// CSV HELPERS
// ============================================================================

fn open_csv(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or("")
}

fn parse_i64(record: &csv::StringRecord, idx: usize, line: usize, what: &str) -> Result<i64> {
    let raw = field(record, idx);
    raw.parse::<i64>()
        .with_context(|| format!("Invalid {} '{}' on line {}", what, raw, line))
}

fn parse_date(raw: &str, line: usize) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .with_context(|| format!("Invalid date '{}' on line {}", raw, line))
}

fn parse_opt_date(raw: &str, line: usize) -> Result<Option<DateTime<Utc>>> {
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_date(raw, line).map(Some)
    }
}

// ============================================================================
// IN-MEMORY FIXTURES
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================
