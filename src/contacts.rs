use std::sync::Arc;

use crate::models::{Contact, ConsultationStatus, Identity, Role, UserId};
use crate::registry::ConnectionRegistry;
use crate::store::{Database, Tables};

/// Works out who a user may message. Always computed from the current
/// store contents, so a freshly accepted consultation is visible at once.
pub struct ContactResolver {
    db: Arc<Database>,
    registry: Arc<ConnectionRegistry>,
}

impl ContactResolver {
    pub fn new(db: Arc<Database>, registry: Arc<ConnectionRegistry>) -> Self {
        ContactResolver { db, registry }
    }

    pub async fn contacts_for(&self, identity: &Identity) -> Vec<Contact> {
        let mut contacts = self
            .db
            .read(|tables| {
                counterparties(tables, identity)
                    .into_iter()
                    .filter_map(|id| tables.users.get(&id))
                    .map(|user| Contact {
                        user_id: user.id,
                        name: user.name.clone(),
                        role: user.role,
                        online: false,
                    })
                    .collect::<Vec<_>>()
            })
            .await;

        for contact in &mut contacts {
            contact.online = self.registry.is_online(contact.user_id).await;
        }
        contacts
    }
}

/// Counterparty ids in discovery order: direct assignments first, then
/// accepted consultations. Pending and declined requests grant nothing.
pub fn counterparties(tables: &Tables, identity: &Identity) -> Vec<UserId> {
    let me = identity.user_id;
    let mut found = Vec::new();

    match identity.role {
        Role::Patient => {
            if let Some(profile) = tables.patients.get(&me) {
                for id in profile.doctor_id.into_iter().chain(profile.volunteer_id) {
                    push_unique(&mut found, id);
                }
            }
            for consultation in tables.consultations.values() {
                if consultation.patient_id == me
                    && consultation.status == ConsultationStatus::Accepted
                {
                    push_unique(&mut found, consultation.doctor_id);
                }
            }
        }
        Role::Doctor => {
            for profile in tables.patients.values() {
                if profile.doctor_id == Some(me) {
                    push_unique(&mut found, profile.user_id);
                }
            }
            for consultation in tables.consultations.values() {
                if consultation.doctor_id == me
                    && consultation.status == ConsultationStatus::Accepted
                {
                    push_unique(&mut found, consultation.patient_id);
                }
            }
        }
        Role::Volunteer => {
            for profile in tables.patients.values() {
                if profile.volunteer_id == Some(me) {
                    push_unique(&mut found, profile.user_id);
                }
            }
        }
    }
    found
}

fn push_unique(found: &mut Vec<UserId>, id: UserId) {
    if !found.contains(&id) {
        found.push(id);
    }
}
