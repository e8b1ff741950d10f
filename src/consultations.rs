use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;

use crate::delivery::DeliveryEngine;
use crate::error::{CareError, CareResult};
use crate::messages::ServerMessage;
use crate::models::{
    Consultation, ConsultationId, ConsultationStatus, Identity, PatientProfile, Role, UserId,
};
use crate::store::{Database, Tables};

/// Consultation requests and the patient assignment edges they create.
pub struct ConsultationLedger {
    db: Arc<Database>,
    engine: Arc<DeliveryEngine>,
}

impl ConsultationLedger {
    pub fn new(db: Arc<Database>, engine: Arc<DeliveryEngine>) -> Self {
        ConsultationLedger { db, engine }
    }

    pub async fn create(
        &self,
        patient_id: UserId,
        doctor_id: UserId,
        notes: Option<String>,
        appointment_time: Option<DateTime<Utc>>,
    ) -> CareResult<Consultation> {
        let consultation = self
            .db
            .transaction(|tables| {
                if tables.user(patient_id)?.role != Role::Patient {
                    return Err(CareError::Forbidden(
                        "only patients can request a consultation".into(),
                    ));
                }
                if !tables.patients.contains_key(&patient_id) {
                    return Err(CareError::NotFound(format!("patient profile {patient_id}")));
                }
                tables.user_with_role(doctor_id, Role::Doctor)?;

                let duplicate = tables.consultations.values().any(|c| {
                    c.patient_id == patient_id
                        && c.doctor_id == doctor_id
                        && c.status == ConsultationStatus::Pending
                });
                if duplicate {
                    return Err(CareError::Conflict(format!(
                        "a pending request to doctor {doctor_id} already exists"
                    )));
                }

                let consultation = Consultation {
                    id: tables.allocate_consultation_id(),
                    patient_id,
                    doctor_id,
                    status: ConsultationStatus::Pending,
                    appointment_time,
                    notes,
                    created_at: Utc::now(),
                };
                tables
                    .consultations
                    .insert(consultation.id, consultation.clone());
                Ok(consultation)
            })
            .await?;

        info!(
            "Consultation {} requested by patient {} for doctor {}",
            consultation.id, patient_id, doctor_id
        );
        self.announce(&[doctor_id], &consultation);
        Ok(consultation)
    }

    /// Accepts a pending request. Status, appointment time and the patient's
    /// doctor assignment change together or not at all.
    pub async fn accept(
        &self,
        consultation_id: ConsultationId,
        acting_doctor_id: UserId,
        appointment_time: Option<DateTime<Utc>>,
    ) -> CareResult<Consultation> {
        let consultation = self
            .db
            .transaction(|tables| {
                let consultation = Self::guarded(tables, consultation_id, acting_doctor_id)?;
                consultation.status = consultation.status.accept()?;
                if appointment_time.is_some() {
                    consultation.appointment_time = appointment_time;
                }
                let accepted = consultation.clone();

                let profile = tables.patients.get_mut(&accepted.patient_id).ok_or_else(|| {
                    CareError::NotFound(format!("patient profile {}", accepted.patient_id))
                })?;
                profile.doctor_id = Some(accepted.doctor_id);
                Ok(accepted)
            })
            .await?;

        info!(
            "Consultation {} accepted by doctor {}",
            consultation.id, acting_doctor_id
        );
        self.announce(&[consultation.patient_id, consultation.doctor_id], &consultation);
        Ok(consultation)
    }

    pub async fn decline(
        &self,
        consultation_id: ConsultationId,
        acting_doctor_id: UserId,
    ) -> CareResult<Consultation> {
        let consultation = self
            .db
            .transaction(|tables| {
                let consultation = Self::guarded(tables, consultation_id, acting_doctor_id)?;
                consultation.status = consultation.status.decline()?;
                Ok(consultation.clone())
            })
            .await?;

        info!(
            "Consultation {} declined by doctor {}",
            consultation.id, acting_doctor_id
        );
        self.announce(&[consultation.patient_id, consultation.doctor_id], &consultation);
        Ok(consultation)
    }

    pub async fn get(&self, consultation_id: ConsultationId) -> CareResult<Consultation> {
        self.db
            .read(|tables| tables.consultations.get(&consultation_id).cloned())
            .await
            .ok_or_else(|| CareError::NotFound(format!("consultation {consultation_id}")))
    }

    pub async fn pending_for_doctor(&self, doctor_id: UserId) -> Vec<Consultation> {
        self.db
            .read(|tables| {
                tables
                    .consultations
                    .values()
                    .filter(|c| c.doctor_id == doctor_id && c.status == ConsultationStatus::Pending)
                    .cloned()
                    .collect()
            })
            .await
    }

    /// A patient's own requests, or the requests addressed to a doctor.
    pub async fn list_for(&self, identity: &Identity) -> Vec<Consultation> {
        let Identity { user_id, role } = *identity;
        self.db
            .read(|tables| {
                tables
                    .consultations
                    .values()
                    .filter(|c| match role {
                        Role::Patient => c.patient_id == user_id,
                        Role::Doctor => c.doctor_id == user_id,
                        Role::Volunteer => false,
                    })
                    .cloned()
                    .collect()
            })
            .await
    }

    pub async fn assign_volunteer(
        &self,
        acting: &Identity,
        patient_id: UserId,
        volunteer_id: UserId,
    ) -> CareResult<PatientProfile> {
        acting.require(Role::Doctor)?;
        let profile = self
            .db
            .transaction(|tables| {
                tables.user_with_role(volunteer_id, Role::Volunteer)?;
                let profile = tables
                    .patients
                    .get_mut(&patient_id)
                    .ok_or_else(|| CareError::NotFound(format!("patient profile {patient_id}")))?;
                profile.volunteer_id = Some(volunteer_id);
                Ok(profile.clone())
            })
            .await?;
        info!(
            "Volunteer {} assigned to patient {} by doctor {}",
            volunteer_id, patient_id, acting.user_id
        );
        Ok(profile)
    }

    fn guarded(
        tables: &mut Tables,
        consultation_id: ConsultationId,
        acting_doctor_id: UserId,
    ) -> CareResult<&mut Consultation> {
        let consultation = tables
            .consultations
            .get_mut(&consultation_id)
            .ok_or_else(|| CareError::NotFound(format!("consultation {consultation_id}")))?;
        if consultation.doctor_id != acting_doctor_id {
            return Err(CareError::Forbidden(format!(
                "consultation {consultation_id} is addressed to another doctor"
            )));
        }
        Ok(consultation)
    }

    fn announce(&self, recipients: &[UserId], consultation: &Consultation) {
        self.engine.notify(
            recipients,
            ServerMessage::ConsultationUpdated {
                consultation: consultation.clone(),
            },
        );
    }
}
