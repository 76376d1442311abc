//! Emergency contact directory.
//!
//! Ordered collection of contacts with a single-primary invariant:
//! among active contacts at most one is primary, and promoting a contact
//! clears the flag on every other contact in the same mutation. The
//! active list (primary first, then insertion order) is the escalation
//! order used by the engine.
//!
//! Every mutation validates first, then applies, then writes through to
//! the contact repository; a rejected mutation leaves the directory
//! untouched.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EmergencyError;
use crate::store::Repository;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub relationship: String,
    /// First-call contact. At most one among active contacts.
    pub is_primary: bool,
    /// Inactive contacts are kept but never dialed.
    pub is_active: bool,
    pub added_date: DateTime<Utc>,
}

/// Input for `add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContact {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub relationship: String,
    #[serde(default)]
    pub is_primary: bool,
}

/// Partial update for `update`. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactPatch {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub relationship: Option<String>,
    pub is_primary: Option<bool>,
    pub is_active: Option<bool>,
}

pub struct ContactDirectory {
    contacts: RwLock<Vec<Contact>>,
    store: Box<dyn Repository<Vec<Contact>>>,
}

impl ContactDirectory {
    /// Load the directory from its repository; an absent record starts
    /// the directory empty.
    pub fn load(store: Box<dyn Repository<Vec<Contact>>>) -> Result<Self, EmergencyError> {
        let contacts = store.load()?.unwrap_or_default();
        Ok(Self {
            contacts: RwLock::new(contacts),
            store,
        })
    }

    /// Add a contact. Rejects empty name or phone before mutating; if
    /// the new contact is primary, every other contact loses the flag.
    pub fn add(&self, new: NewContact) -> Result<Uuid, EmergencyError> {
        validate(&new.name, &new.phone)?;

        let contact = Contact {
            id: Uuid::new_v4(),
            name: new.name,
            phone: new.phone,
            relationship: new.relationship,
            is_primary: new.is_primary,
            is_active: true,
            added_date: Utc::now(),
        };
        let id = contact.id;

        let mut contacts = self
            .contacts
            .write()
            .map_err(|_| EmergencyError::LockPoisoned)?;
        if contact.is_primary {
            for c in contacts.iter_mut() {
                c.is_primary = false;
            }
        }
        contacts.push(contact);
        self.store.save(&contacts)?;
        Ok(id)
    }

    /// Apply a partial update. Unknown ids are an error; promoting to
    /// primary demotes every other contact atomically.
    pub fn update(&self, id: Uuid, patch: ContactPatch) -> Result<(), EmergencyError> {
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(EmergencyError::Validation("contact name is required".into()));
            }
        }
        if let Some(phone) = &patch.phone {
            if phone.trim().is_empty() {
                return Err(EmergencyError::Validation(
                    "contact phone is required".into(),
                ));
            }
        }

        let mut contacts = self
            .contacts
            .write()
            .map_err(|_| EmergencyError::LockPoisoned)?;
        if !contacts.iter().any(|c| c.id == id) {
            return Err(EmergencyError::ContactNotFound(id));
        }

        let promote = patch.is_primary == Some(true);
        for c in contacts.iter_mut() {
            if c.id == id {
                if let Some(name) = patch.name.clone() {
                    c.name = name;
                }
                if let Some(phone) = patch.phone.clone() {
                    c.phone = phone;
                }
                if let Some(relationship) = patch.relationship.clone() {
                    c.relationship = relationship;
                }
                if let Some(is_primary) = patch.is_primary {
                    c.is_primary = is_primary;
                }
                if let Some(is_active) = patch.is_active {
                    c.is_active = is_active;
                }
            } else if promote {
                c.is_primary = false;
            }
        }
        self.store.save(&contacts)?;
        Ok(())
    }

    /// Remove a contact. Removing an unknown id is a no-op.
    pub fn remove(&self, id: Uuid) -> Result<(), EmergencyError> {
        let mut contacts = self
            .contacts
            .write()
            .map_err(|_| EmergencyError::LockPoisoned)?;
        let before = contacts.len();
        contacts.retain(|c| c.id != id);
        if contacts.len() != before {
            self.store.save(&contacts)?;
        }
        Ok(())
    }

    /// Escalation order: active contacts, primary first, remaining in
    /// insertion order.
    pub fn list_active(&self) -> Vec<Contact> {
        match self.contacts.read() {
            Ok(contacts) => {
                let mut active: Vec<Contact> =
                    contacts.iter().filter(|c| c.is_active).cloned().collect();
                // Stable sort keeps insertion order among non-primaries.
                active.sort_by_key(|c| !c.is_primary);
                active
            }
            Err(_) => {
                tracing::error!("contact directory lock poisoned, treating as empty");
                Vec::new()
            }
        }
    }

    /// All contacts in insertion order (snapshot copy).
    pub fn all(&self) -> Vec<Contact> {
        match self.contacts.read() {
            Ok(contacts) => contacts.clone(),
            Err(_) => {
                tracing::error!("contact directory lock poisoned, treating as empty");
                Vec::new()
            }
        }
    }
}

fn validate(name: &str, phone: &str) -> Result<(), EmergencyError> {
    if name.trim().is_empty() {
        return Err(EmergencyError::Validation("contact name is required".into()));
    }
    if phone.trim().is_empty() {
        return Err(EmergencyError::Validation(
            "contact phone is required".into(),
        ));
    }
    Ok(())
}
