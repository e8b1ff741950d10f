use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::auth::hash_token;
use crate::error::{CareError, CareResult};
use crate::models::{
    Consultation, ConsultationId, Message, MessageId, PatientProfile, Role, UserAccount, UserId,
};

/// Accounts, patient profiles and consultations. Messages live in their own
/// append-only log so writes here never touch chat history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub users: BTreeMap<UserId, UserAccount>,
    pub patients: BTreeMap<UserId, PatientProfile>,
    pub consultations: BTreeMap<ConsultationId, Consultation>,
    #[serde(default)]
    next_consultation_id: ConsultationId,
}

impl Tables {
    pub fn user(&self, id: UserId) -> CareResult<&UserAccount> {
        self.users
            .get(&id)
            .ok_or_else(|| CareError::NotFound(format!("user {id}")))
    }

    pub fn user_with_role(&self, id: UserId, role: Role) -> CareResult<&UserAccount> {
        let user = self.user(id)?;
        if user.role == role {
            Ok(user)
        } else {
            Err(CareError::NotFound(format!("{role:?} {id}")))
        }
    }

    pub fn allocate_consultation_id(&mut self) -> ConsultationId {
        self.next_consultation_id += 1;
        self.next_consultation_id
    }
}

#[derive(Default)]
struct MessageLog {
    messages: Vec<Message>,
    last_id: MessageId,
    journal: Option<fs::File>,
}

/// The persistent store. Reads see a consistent view; table writes go
/// through [`Database::transaction`], which publishes nothing unless the
/// closure and the snapshot flush both succeed. Messages are appended to a
/// JSON-lines journal beside the snapshot, one line per message.
pub struct Database {
    tables: RwLock<Tables>,
    log: RwLock<MessageLog>,
    snapshot_path: Option<PathBuf>,
}

impl Database {
    pub fn in_memory() -> Self {
        Database {
            tables: RwLock::new(Tables::default()),
            log: RwLock::new(MessageLog::default()),
            snapshot_path: None,
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> CareResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match fs::read(&path).await {
            Ok(bytes) => {
                let tables: Tables = serde_json::from_slice(&bytes)?;
                info!(
                    "Loaded store snapshot {} ({} users, {} consultations)",
                    path.display(),
                    tables.users.len(),
                    tables.consultations.len()
                );
                tables
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting with an empty store", path.display());
                Tables::default()
            }
            Err(e) => return Err(e.into()),
        };

        let journal_path = sibling(&path, ".journal");
        let messages = load_journal(&journal_path).await?;
        let journal = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .await?;
        info!(
            "Loaded message journal {} ({} messages)",
            journal_path.display(),
            messages.len()
        );

        Ok(Database {
            tables: RwLock::new(tables),
            log: RwLock::new(MessageLog {
                last_id: messages.iter().map(|m| m.id).max().unwrap_or(0),
                messages,
                journal: Some(journal),
            }),
            snapshot_path: Some(path),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.snapshot_path.is_some()
    }

    pub async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read().await;
        f(&tables)
    }

    pub async fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> CareResult<T>,
    ) -> CareResult<T> {
        let mut tables = self.tables.write().await;
        let mut working = tables.clone();
        let value = f(&mut working)?;

        if let Some(path) = &self.snapshot_path {
            if let Err(e) = Self::flush(path, &working).await {
                error!("Failed to persist store snapshot {}: {}", path.display(), e);
                return Err(e);
            }
        }

        *tables = working;
        Ok(value)
    }

    async fn flush(path: &Path, tables: &Tables) -> CareResult<()> {
        let bytes = serde_json::to_vec(tables)?;
        let tmp = sibling(path, ".tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Appends one message. `build` receives the next id and the newest
    /// stored message. The message is visible to readers only after its
    /// journal line was written.
    pub async fn append_message(
        &self,
        build: impl FnOnce(MessageId, Option<&Message>) -> Message,
    ) -> CareResult<Message> {
        let mut log = self.log.write().await;
        let id = log.last_id + 1;
        let message = build(id, log.messages.last());

        if let Some(journal) = log.journal.as_mut() {
            let mut line = serde_json::to_vec(&message)?;
            line.push(b'\n');
            let written = match journal.write_all(&line).await {
                Ok(()) => journal.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                error!("Failed to append message {} to the journal: {}", id, e);
                return Err(e.into());
            }
        }

        log.last_id = id;
        log.messages.push(message.clone());
        Ok(message)
    }

    pub async fn messages<T>(&self, f: impl FnOnce(&[Message]) -> T) -> T {
        let log = self.log.read().await;
        f(&log.messages)
    }

    pub async fn insert_user(
        &self,
        id: UserId,
        email: &str,
        name: &str,
        role: Role,
        token: &str,
    ) -> CareResult<UserAccount> {
        let account = UserAccount {
            id,
            email: email.to_string(),
            name: name.to_string(),
            role,
            token_hash: hash_token(token),
        };
        self.transaction(|tables| {
            if tables.users.contains_key(&id) {
                return Err(CareError::Conflict(format!("user {id} already exists")));
            }
            tables.users.insert(id, account.clone());
            if role == Role::Patient {
                tables.patients.insert(id, PatientProfile::new(id));
            }
            Ok(account)
        })
        .await
    }

    pub async fn upsert_patient(&self, profile: PatientProfile) -> CareResult<()> {
        self.transaction(|tables| {
            tables.user_with_role(profile.user_id, Role::Patient)?;
            tables.patients.insert(profile.user_id, profile);
            Ok(())
        })
        .await
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Reads every intact line of the journal. A line cut short by a crash is
/// skipped rather than failing the whole open.
async fn load_journal(path: &Path) -> CareResult<Vec<Message>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut messages = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(message) => messages.push(message),
            Err(e) => warn!(
                "Skipping unreadable line {} of {}: {}",
                number + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(messages)
}
