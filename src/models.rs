use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CareError, CareResult};

pub type UserId = i64;
pub type MessageId = u64;
pub type ConsultationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Volunteer,
}

/// Who is acting, as resolved from a session credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Identity { user_id, role }
    }

    pub fn require(&self, role: Role) -> CareResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(CareError::Forbidden(format!(
                "this action requires the {role:?} role"
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub token_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientProfile {
    pub user_id: UserId,
    pub doctor_id: Option<UserId>,
    pub volunteer_id: Option<UserId>,
}

impl PatientProfile {
    pub fn new(user_id: UserId) -> Self {
        PatientProfile {
            user_id,
            doctor_id: None,
            volunteer_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn involves(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.recipient_id == b)
            || (self.sender_id == b && self.recipient_id == a)
    }
}

/// Lifecycle of a consultation request. `Pending` is the only state that
/// can move; both outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsultationStatus {
    Pending,
    Accepted,
    #[serde(alias = "rejected")]
    Declined,
}

impl ConsultationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConsultationStatus::Pending)
    }

    pub fn accept(self) -> CareResult<Self> {
        self.transition(ConsultationStatus::Accepted)
    }

    pub fn decline(self) -> CareResult<Self> {
        self.transition(ConsultationStatus::Declined)
    }

    fn transition(self, next: ConsultationStatus) -> CareResult<Self> {
        match self {
            ConsultationStatus::Pending => Ok(next),
            terminal => Err(CareError::InvalidState(format!(
                "consultation is already {terminal:?}, cannot move to {next:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consultation {
    pub id: ConsultationId,
    pub patient_id: UserId,
    pub doctor_id: UserId,
    pub status: ConsultationStatus,
    pub appointment_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A counterparty the caller may message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: UserId,
    pub name: String,
    pub role: Role,
    pub online: bool,
}
