use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

use crate::auth::{require, Credential, IdentityResolver, Permission};
use crate::limits::*;
use crate::model::*;

use super::conflict::{clean_optional, clean_required, now_ms};
use super::{Engine, EngineError};

fn normalize_email(email: &str) -> Result<String, EngineError> {
    let email = email.trim().to_lowercase();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(EngineError::Validation("email must look like name@domain")),
    }
}

/// `"Initial Report (v2)"` → `"initial-report-v2"`.
fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { "document".to_string() } else { out }
}

impl Engine {
    /// Register a user. An email that is already registered returns the
    /// existing account unchanged.
    pub async fn register(
        &self,
        email: &str,
        name: &str,
        role: Role,
        department: Option<String>,
    ) -> Result<User, EngineError> {
        let _commit = self.commit_gate.read().await;
        let email = normalize_email(email)?;
        let name = clean_required(name, MAX_NAME_LEN, "name is required", "name too long")?;
        let department = clean_optional(department, MAX_DEPARTMENT_LEN, "department too long")?;

        let _writing = self.user_writes.lock().await;
        if let Some(existing) = self.user_by_email(&email) {
            return Ok(existing);
        }
        let id = Ulid::new();
        self.persist(&Event::UserRegistered {
            id,
            name,
            email,
            role,
            department,
            created_at: now_ms(),
        })
        .await?;
        info!("registered user {id} as {role}");
        self.get_user(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn login(&self, email: &str) -> Result<User, EngineError> {
        let email = email.trim().to_lowercase();
        self.user_by_email(&email)
            .ok_or(EngineError::EmailNotFound(email))
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(email)?.value();
        self.get_user(&id)
    }

    /// Change the caller's own name and/or department. `None` keeps the current value.
    pub async fn update_me(
        &self,
        actor: &User,
        name: Option<String>,
        department: Option<String>,
    ) -> Result<User, EngineError> {
        let _commit = self.commit_gate.read().await;
        let name = name
            .map(|n| clean_required(&n, MAX_NAME_LEN, "name is required", "name too long"))
            .transpose()?;
        let department = department
            .map(|d| clean_optional(Some(d), MAX_DEPARTMENT_LEN, "department too long"))
            .transpose()?;

        let _writing = self.user_writes.lock().await;
        let current = self.get_user(&actor.id).ok_or(EngineError::NotFound(actor.id))?;
        let name = name.unwrap_or(current.name);
        let department = department.unwrap_or(current.department);
        self.persist(&Event::UserUpdated {
            id: actor.id,
            name,
            department,
        })
        .await?;
        self.get_user(&actor.id).ok_or(EngineError::NotFound(actor.id))
    }

    /// Provision a lab. Used by the seed import; not reachable by end users.
    pub async fn create_lab(
        &self,
        name: &str,
        location: &str,
        capacity: u32,
        status: LabStatus,
    ) -> Result<Lab, EngineError> {
        let _commit = self.commit_gate.read().await;
        if self.labs.len() >= MAX_LABS {
            return Err(EngineError::LimitExceeded("too many labs"));
        }
        let name = clean_required(name, MAX_NAME_LEN, "lab name is required", "lab name too long")?;
        let location = clean_required(location, MAX_NAME_LEN, "location is required", "location too long")?;
        let id = Ulid::new();
        self.persist(&Event::LabCreated {
            id,
            name,
            location,
            capacity,
            status,
        })
        .await?;
        let ls = self.get_lab(&id).ok_or(EngineError::NotFound(id))?;
        let lab = ls.read().await.lab.clone();
        Ok(lab)
    }

    pub async fn find_lab_by_name(&self, name: &str) -> Option<Lab> {
        let labs: Vec<_> = self.labs.iter().map(|e| e.value().clone()).collect();
        for ls in labs {
            let guard = ls.read().await;
            if guard.lab.name == name {
                return Some(guard.lab.clone());
            }
        }
        None
    }

    pub fn equipment_of(&self, lab_id: Ulid) -> Vec<Equipment> {
        self.equipment
            .iter()
            .filter(|e| e.lab_id == lab_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub async fn slot_count(&self, lab_id: Ulid) -> usize {
        match self.get_lab(&lab_id) {
            Some(ls) => ls.read().await.slots.len(),
            None => 0,
        }
    }

    pub async fn add_equipment(
        &self,
        lab_id: Ulid,
        name: &str,
        kind: &str,
        serial_number: Option<String>,
    ) -> Result<Equipment, EngineError> {
        let _commit = self.commit_gate.read().await;
        if !self.labs.contains_key(&lab_id) {
            return Err(EngineError::NotFound(lab_id));
        }
        let name = clean_required(name, MAX_NAME_LEN, "equipment name is required", "equipment name too long")?;
        let kind = clean_required(kind, MAX_NAME_LEN, "equipment type is required", "equipment type too long")?;
        let serial_number = clean_optional(serial_number, MAX_NAME_LEN, "serial number too long")?;
        let id = Ulid::new();
        self.persist(&Event::EquipmentAdded {
            id,
            lab_id,
            name,
            kind,
            status: EquipmentStatus::Available,
            serial_number,
        })
        .await?;
        self.equipment
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn create_experiment(
        &self,
        actor: &User,
        lab_id: Ulid,
        title: &str,
        description: Option<String>,
    ) -> Result<Experiment, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::ExperimentUpload)?;
        let title = clean_required(title, MAX_TITLE_LEN, "title is required", "title too long")?;
        let description = clean_optional(description, MAX_DESCRIPTION_LEN, "description too long")?;
        if !self.labs.contains_key(&lab_id) {
            return Err(EngineError::NotFound(lab_id));
        }
        let id = Ulid::new();
        self.persist(&Event::ExperimentCreated {
            id,
            lab_id,
            created_by: actor.id,
            title,
            description,
            created_at: now_ms(),
        })
        .await?;
        let es = self
            .experiments
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let experiment = es.read().await.experiment.clone();
        Ok(experiment)
    }

    /// Record a document against an experiment. Re-uploading a title bumps its version.
    pub async fn upload_document(
        &self,
        actor: &User,
        experiment_id: Ulid,
        kind: DocumentKind,
        title: &str,
        url: Option<String>,
    ) -> Result<Document, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::ExperimentUpload)?;
        let title = clean_required(title, MAX_TITLE_LEN, "title is required", "title too long")?;
        let url = clean_optional(url, MAX_URL_LEN, "url too long")?
            .unwrap_or_else(|| format!("/docs/{}.pdf", slug(&title)));
        let es = self
            .experiments
            .get(&experiment_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(experiment_id))?;

        let mut guard = es.write().await;
        let document = Document {
            id: Ulid::new(),
            experiment_id,
            kind,
            version: guard.next_version(&title),
            title,
            url,
            uploaded_by: actor.id,
            uploaded_at: now_ms(),
        };
        self.wal_append(&Event::DocumentUploaded {
            document: document.clone(),
        })
        .await?;
        guard.documents.push(document.clone());
        info!(
            "document {} v{} uploaded to experiment {experiment_id}",
            document.id, document.version
        );
        Ok(document)
    }
}

#[async_trait]
impl IdentityResolver for Engine {
    async fn resolve(&self, credential: &str) -> Result<User, EngineError> {
        let user = match Credential::parse(credential) {
            Some(Credential::Id(id)) => self.get_user(&id),
            Some(Credential::Email(email)) => self.user_by_email(&email),
            None => None,
        };
        user.ok_or(EngineError::UnknownCredential)
    }
}
