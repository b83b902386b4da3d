//! Startup import of users, labs, equipment and pre-generated slots.
//!
//! Re-running an import is safe: existing users are matched by email, existing
//! labs by name, existing equipment by name within its lab, and a lab that
//! already has slots receives no new ones.

use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::model::{LabStatus, Ms, Role};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub labs: Vec<SeedLab>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedLab {
    pub name: String,
    pub location: String,
    pub capacity: u32,
    #[serde(default = "open")]
    pub status: LabStatus,
    #[serde(default)]
    pub equipment: Vec<SeedEquipment>,
    #[serde(default)]
    pub slots: Vec<SeedSlot>,
}

fn open() -> LabStatus {
    LabStatus::Open
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedEquipment {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SeedSlot {
    pub start: Ms,
    pub end: Ms,
}

/// What an import actually created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub users: usize,
    pub labs: usize,
    pub equipment: usize,
    pub slots: usize,
}

pub fn load(path: &Path) -> io::Result<SeedFile> {
    let file = std::fs::File::open(path)?;
    serde_json::from_reader(io::BufReader::new(file))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn apply(engine: &Engine, seed: &SeedFile) -> Result<SeedReport, EngineError> {
    let mut report = SeedReport::default();

    for u in &seed.users {
        if engine.user_by_email(&u.email.trim().to_lowercase()).is_none() {
            engine
                .register(&u.email, &u.name, u.role, u.department.clone())
                .await?;
            report.users += 1;
        }
    }

    for l in &seed.labs {
        let lab = match engine.find_lab_by_name(l.name.trim()).await {
            Some(lab) => lab,
            None => {
                report.labs += 1;
                engine
                    .create_lab(&l.name, &l.location, l.capacity, l.status)
                    .await?
            }
        };

        let existing: Vec<String> = engine
            .equipment_of(lab.id)
            .into_iter()
            .map(|e| e.name)
            .collect();
        for e in &l.equipment {
            if existing.iter().any(|name| name == e.name.trim()) {
                continue;
            }
            engine
                .add_equipment(lab.id, &e.name, &e.kind, e.serial_number.clone())
                .await?;
            report.equipment += 1;
        }

        if !l.slots.is_empty() && engine.slot_count(lab.id).await == 0 {
            let windows: Vec<(Ms, Ms)> = l.slots.iter().map(|s| (s.start, s.end)).collect();
            report.slots += engine.add_slots(lab.id, &windows).await?.len();
        }
    }

    info!(
        "seed import: {} users, {} labs, {} equipment, {} slots created",
        report.users, report.labs, report.equipment, report.slots
    );
    Ok(report)
}
