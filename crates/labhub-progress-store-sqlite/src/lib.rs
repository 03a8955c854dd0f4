#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use labhub_progress_core::{
    ensure_acyclic, ensure_capability, format_rfc3339, now_utc, parse_rfc3339_utc, Accessibility,
    Capability, Completion, CompletionOutcome, Lab, LabDraft, LabPatch, LabProgressEntry, LabRef,
    NewUser, OverrideOutcome, PrerequisiteLookup, PrerequisiteSet, PrerequisiteState,
    ProgressError, ProgressLedger, ProgressRecord, ProgressSnapshot, ProgressStatus, Rank,
    ScoreOverride, StartOutcome, UserAccount, UserId, UserRole, UserTotals,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use time::OffsetDateTime;

const PROGRESS_MIGRATION_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_PROGRESS_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('student', 'instructor', 'ta', 'admin')),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  rank TEXT NOT NULL DEFAULT 'dabbler' CHECK (
    rank IN (
      'dabbler',
      'hobbyist',
      'enthusiast',
      'explorer',
      'apprentice',
      'researcher',
      'master'
    )
  ),
  total_score REAL NOT NULL DEFAULT 0,
  total_bonus_points REAL NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS labs (
  lab_ref TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  sequence_order INTEGER NOT NULL,
  category TEXT NOT NULL DEFAULT 'Uncategorized',
  max_score REAL NOT NULL CHECK (max_score > 0),
  has_bonus_challenge INTEGER NOT NULL DEFAULT 0 CHECK (has_bonus_challenge IN (0, 1)),
  max_bonus_points REAL NOT NULL DEFAULT 0 CHECK (max_bonus_points >= 0),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_labs_active_sequence
  ON labs(is_active, sequence_order, lab_ref);

CREATE TABLE IF NOT EXISTS lab_prerequisites (
  lab_ref TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  prerequisite_ref TEXT NOT NULL,
  PRIMARY KEY (lab_ref, prerequisite_ref),
  FOREIGN KEY (lab_ref) REFERENCES labs(lab_ref) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS lab_progress (
  user_id TEXT NOT NULL,
  lab_ref TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('locked', 'unlocked', 'in_progress', 'completed')),
  score REAL,
  bonus_points REAL NOT NULL DEFAULT 0,
  attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
  started_at TEXT,
  last_activity TEXT,
  completed_at TEXT,
  instructor_notes TEXT,
  score_overridden INTEGER NOT NULL DEFAULT 0 CHECK (score_overridden IN (0, 1)),
  PRIMARY KEY (user_id, lab_ref),
  FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE,
  FOREIGN KEY (lab_ref) REFERENCES labs(lab_ref) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_lab_progress_lab
  ON lab_progress(lab_ref);
";

const LAB_COLUMNS: &str = "lab_ref, name, description, sequence_order, category, max_score,
    has_bonus_challenge, max_bonus_points, is_active, created_at";

const USER_COLUMNS: &str = "user_id, email, first_name, last_name, role, is_active, rank,
    total_score, total_bonus_points, created_at";

const PROGRESS_COLUMNS: &str = "user_id, lab_ref, status, score, bonus_points, attempts,
    started_at, last_activity, completed_at, instructor_notes, score_overridden";

pub struct SqliteProgressStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LabDeletion {
    pub lab_ref: LabRef,
    pub removed_progress_records: usize,
    pub recomputed_users: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SeedReport {
    pub created: Vec<LabRef>,
    pub skipped: Vec<LabRef>,
}

impl SqliteProgressStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        let _journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("failed to enable WAL journal mode")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to enable foreign keys")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to configure busy timeout")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_PROGRESS_V1)
            .context("failed to apply progress schema")?;

        let now = format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PROGRESS_MIGRATION_VERSION, now],
            )
            .context("failed to register progress schema migration")?;

        tracing::debug!(
            version = PROGRESS_MIGRATION_VERSION,
            newly_applied = inserted > 0,
            "progress schema migrated"
        );

        Ok(())
    }

    pub fn create_user(&mut self, new_user: NewUser) -> Result<UserAccount> {
        new_user.validate()?;

        let tx = self.begin_immediate()?;
        let email = new_user.email.trim().to_string();
        let taken = tx
            .query_row(
                "SELECT 1 FROM users WHERE email = ?1",
                params![email],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to check email uniqueness")?
            .is_some();
        if taken {
            return Err(ProgressError::Validation(format!(
                "email `{email}` is already registered"
            ))
            .into());
        }

        let account = new_user.into_account(UserId::generate(), now_utc());
        tx.execute(
            &format!("INSERT INTO users({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                account.user_id.to_string(),
                account.email,
                account.first_name,
                account.last_name,
                account.role.as_str(),
                bool_to_sql(account.is_active),
                account.rank.as_str(),
                account.total_score,
                account.total_bonus_points,
                format_rfc3339(account.created_at)?,
            ],
        )
        .context("failed to insert user")?;
        tx.commit().context("failed to commit user transaction")?;

        tracing::info!(user_id = %account.user_id, role = account.role.as_str(), "user created");
        Ok(account)
    }

    pub fn get_user(&self, user_id: UserId) -> Result<UserAccount> {
        let user = query_user(&self.conn, user_id).context("failed to load user")?;
        Ok(user.ok_or_else(|| ProgressError::NotFound(format!("user not found: {user_id}")))?)
    }

    pub fn get_lab(&self, lab_ref: &LabRef) -> Result<Lab> {
        let lab = query_lab(&self.conn, lab_ref).context("failed to load lab")?;
        Ok(lab.ok_or_else(|| ProgressError::NotFound(format!("lab not found: {lab_ref}")))?)
    }

    pub fn list_active_labs(&self) -> Result<Vec<Lab>> {
        query_active_labs(&self.conn).context("failed to list active labs")
    }

    pub fn create_lab(&mut self, actor_id: UserId, draft: LabDraft) -> Result<Lab> {
        draft.validate()?;

        let tx = self.begin_immediate()?;
        require_actor(&tx, actor_id, Capability::ManageCatalog)?;
        if lab_exists(&tx, &draft.lab_ref)? {
            return Err(ProgressError::Validation(format!(
                "lab with ref '{}' already exists",
                draft.lab_ref
            ))
            .into());
        }

        let lab = insert_new_lab(&tx, draft)?;
        tx.commit().context("failed to commit lab creation")?;

        tracing::info!(actor_id = %actor_id, lab_ref = %lab.lab_ref, "lab created");
        Ok(lab)
    }

    pub fn update_lab(&mut self, actor_id: UserId, lab_ref: &LabRef, patch: &LabPatch) -> Result<Lab> {
        let tx = self.begin_immediate()?;
        require_actor(&tx, actor_id, Capability::ManageCatalog)?;
        let existing = query_lab(&tx, lab_ref)?
            .ok_or_else(|| ProgressError::NotFound(format!("lab not found: {lab_ref}")))?;

        let updated = patch.apply(&existing);
        updated.validate()?;

        if patch.prerequisites.is_some() {
            ensure_prerequisites_exist(&tx, &updated.prerequisites)?;
            let graph = query_prerequisite_graph(&tx)?;
            ensure_acyclic(&updated.lab_ref, &updated.prerequisites, &graph)?;
        }

        tx.execute(
            "UPDATE labs SET
               name = ?2,
               description = ?3,
               sequence_order = ?4,
               category = ?5,
               max_score = ?6,
               has_bonus_challenge = ?7,
               max_bonus_points = ?8,
               is_active = ?9
             WHERE lab_ref = ?1",
            params![
                updated.lab_ref.as_str(),
                updated.name,
                updated.description,
                updated.sequence_order,
                updated.category,
                updated.max_score,
                bool_to_sql(updated.has_bonus_challenge),
                updated.max_bonus_points,
                bool_to_sql(updated.is_active),
            ],
        )
        .context("failed to update lab")?;
        replace_prerequisites(&tx, &updated.lab_ref, &updated.prerequisites)?;
        tx.commit().context("failed to commit lab update")?;

        tracing::info!(actor_id = %actor_id, lab_ref = %lab_ref, "lab updated");
        Ok(updated)
    }

    /// Deletes a lab with its progress rows and refreshes the aggregate of
    /// every user who had progress on it.
    pub fn delete_lab(&mut self, actor_id: UserId, lab_ref: &LabRef) -> Result<LabDeletion> {
        let tx = self.begin_immediate()?;
        require_actor(&tx, actor_id, Capability::ManageCatalog)?;
        if !lab_exists(&tx, lab_ref)? {
            return Err(ProgressError::NotFound(format!("lab not found: {lab_ref}")).into());
        }

        let affected = {
            let mut stmt = tx
                .prepare("SELECT user_id FROM lab_progress WHERE lab_ref = ?1 ORDER BY user_id ASC")
                .context("failed to prepare affected user query")?;
            let rows = stmt.query_map(params![lab_ref.as_str()], |row| parse_user_id_column(row, 0))?;
            collect_rows(rows)?
        };

        tx.execute("DELETE FROM labs WHERE lab_ref = ?1", params![lab_ref.as_str()])
            .context("failed to delete lab")?;

        {
            let mut ledger = SqliteLedger { conn: &tx };
            for user_id in &affected {
                labhub_progress_core::refresh_user_totals(&mut ledger, *user_id)?;
            }
        }
        tx.commit().context("failed to commit lab deletion")?;

        tracing::info!(
            actor_id = %actor_id,
            lab_ref = %lab_ref,
            recomputed_users = affected.len(),
            "lab deleted"
        );
        Ok(LabDeletion {
            lab_ref: lab_ref.clone(),
            removed_progress_records: affected.len(),
            recomputed_users: affected.len(),
        })
    }

    /// Installs catalog entries in order, skipping refs that already exist.
    pub fn seed_catalog(&mut self, drafts: &[LabDraft]) -> Result<SeedReport> {
        for draft in drafts {
            draft.validate()?;
        }

        let tx = self.begin_immediate()?;
        let mut report = SeedReport::default();
        for draft in drafts {
            if lab_exists(&tx, &draft.lab_ref)? {
                report.skipped.push(draft.lab_ref.clone());
                continue;
            }
            let lab = insert_new_lab(&tx, draft.clone())?;
            report.created.push(lab.lab_ref);
        }
        tx.commit().context("failed to commit catalog seed")?;

        tracing::info!(
            created = report.created.len(),
            skipped = report.skipped.len(),
            "catalog seeded"
        );
        Ok(report)
    }

    pub fn check_accessibility(&self, user_id: UserId, lab_ref: &LabRef) -> Result<Accessibility> {
        let ledger = SqliteLedger { conn: &self.conn };
        Ok(labhub_progress_core::check_accessibility(&ledger, user_id, lab_ref)?)
    }

    pub fn start_lab(&mut self, user_id: UserId, lab_ref: &LabRef) -> Result<StartOutcome> {
        let tx = self.begin_immediate()?;
        let outcome = {
            let mut ledger = SqliteLedger { conn: &tx };
            labhub_progress_core::start_lab(&mut ledger, user_id, lab_ref, now_utc())?
        };
        tx.commit().context("failed to commit start transaction")?;
        Ok(outcome)
    }

    pub fn complete_lab(
        &mut self,
        user_id: UserId,
        lab_ref: &LabRef,
        completion: &Completion,
    ) -> Result<CompletionOutcome> {
        let tx = self.begin_immediate()?;
        let outcome = {
            let mut ledger = SqliteLedger { conn: &tx };
            labhub_progress_core::complete_lab(&mut ledger, user_id, lab_ref, completion, now_utc())?
        };
        tx.commit().context("failed to commit completion transaction")?;
        Ok(outcome)
    }

    pub fn override_progress(
        &mut self,
        actor_id: UserId,
        user_id: UserId,
        lab_ref: &LabRef,
        change: &ScoreOverride,
    ) -> Result<OverrideOutcome> {
        let tx = self.begin_immediate()?;
        let outcome = {
            let mut ledger = SqliteLedger { conn: &tx };
            labhub_progress_core::override_progress(&mut ledger, actor_id, user_id, lab_ref, change)?
        };
        tx.commit().context("failed to commit override transaction")?;
        Ok(outcome)
    }

    pub fn progress_snapshot(&self, user_id: UserId) -> Result<ProgressSnapshot> {
        let ledger = SqliteLedger { conn: &self.conn };
        Ok(labhub_progress_core::progress_snapshot(&ledger, user_id)?)
    }

    pub fn progress_snapshot_as(&self, actor_id: UserId, user_id: UserId) -> Result<ProgressSnapshot> {
        let ledger = SqliteLedger { conn: &self.conn };
        Ok(labhub_progress_core::progress_snapshot_as(
            &ledger, actor_id, user_id,
        )?)
    }

    pub fn lab_progress(&self, user_id: UserId, lab_ref: &LabRef) -> Result<LabProgressEntry> {
        let ledger = SqliteLedger { conn: &self.conn };
        Ok(labhub_progress_core::lab_progress(&ledger, user_id, lab_ref)?)
    }

    fn begin_immediate(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin immediate transaction")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Ledger view over one connection or open transaction.
struct SqliteLedger<'a> {
    conn: &'a Connection,
}

impl PrerequisiteLookup for SqliteLedger<'_> {
    fn prerequisite_state(
        &self,
        user_id: UserId,
        prerequisite: &LabRef,
    ) -> Result<PrerequisiteState, ProgressError> {
        if !lab_exists(self.conn, prerequisite)? {
            return Ok(PrerequisiteState::Retired);
        }

        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM lab_progress WHERE user_id = ?1 AND lab_ref = ?2",
                params![user_id.to_string(), prerequisite.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)?;

        match status {
            None => Ok(PrerequisiteState::Tracked(None)),
            Some(raw) => ProgressStatus::parse(&raw)
                .map(|status| PrerequisiteState::Tracked(Some(status)))
                .ok_or_else(|| ProgressError::Storage(format!("invalid stored status: {raw}"))),
        }
    }
}

impl ProgressLedger for SqliteLedger<'_> {
    fn lab_by_ref(&self, lab_ref: &LabRef) -> Result<Option<Lab>, ProgressError> {
        query_lab(self.conn, lab_ref)
    }

    fn list_active_labs(&self) -> Result<Vec<Lab>, ProgressError> {
        query_active_labs(self.conn)
    }

    fn catalog_refs(&self) -> Result<Vec<LabRef>, ProgressError> {
        let mut stmt = self
            .conn
            .prepare("SELECT lab_ref FROM labs ORDER BY lab_ref ASC")
            .map_err(storage_error)?;
        let rows = stmt
            .query_map([], |row| parse_lab_ref_column(row, 0))
            .map_err(storage_error)?;
        collect_rows(rows)
    }

    fn user(&self, user_id: UserId) -> Result<Option<UserAccount>, ProgressError> {
        query_user(self.conn, user_id)
    }

    fn progress(
        &self,
        user_id: UserId,
        lab_ref: &LabRef,
    ) -> Result<Option<ProgressRecord>, ProgressError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM lab_progress WHERE user_id = ?1 AND lab_ref = ?2"
                ),
                params![user_id.to_string(), lab_ref.as_str()],
                parse_progress_row,
            )
            .optional()
            .map_err(storage_error)
    }

    fn list_progress_for_user(&self, user_id: UserId) -> Result<Vec<ProgressRecord>, ProgressError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PROGRESS_COLUMNS} FROM lab_progress WHERE user_id = ?1 ORDER BY lab_ref ASC"
            ))
            .map_err(storage_error)?;
        let rows = stmt
            .query_map(params![user_id.to_string()], parse_progress_row)
            .map_err(storage_error)?;
        collect_rows(rows)
    }

    fn upsert_progress(&mut self, record: &ProgressRecord) -> Result<(), ProgressError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO lab_progress({PROGRESS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(user_id, lab_ref) DO UPDATE SET
                       status = excluded.status,
                       score = excluded.score,
                       bonus_points = excluded.bonus_points,
                       attempts = excluded.attempts,
                       started_at = excluded.started_at,
                       last_activity = excluded.last_activity,
                       completed_at = excluded.completed_at,
                       instructor_notes = excluded.instructor_notes,
                       score_overridden = excluded.score_overridden"
                ),
                params![
                    record.user_id.to_string(),
                    record.lab_ref.as_str(),
                    record.status.as_str(),
                    record.score,
                    record.bonus_points,
                    i64::from(record.attempts),
                    optional_timestamp(record.started_at)?,
                    optional_timestamp(record.last_activity)?,
                    optional_timestamp(record.completed_at)?,
                    record.instructor_notes,
                    bool_to_sql(record.score_overridden),
                ],
            )
            .map_err(storage_error)?;
        Ok(())
    }

    fn update_user_totals(&mut self, user_id: UserId, totals: &UserTotals) -> Result<(), ProgressError> {
        let changed = self
            .conn
            .execute(
                "UPDATE users SET rank = ?2, total_score = ?3, total_bonus_points = ?4
                 WHERE user_id = ?1",
                params![
                    user_id.to_string(),
                    totals.rank.as_str(),
                    totals.total_score,
                    totals.total_bonus_points,
                ],
            )
            .map_err(storage_error)?;

        if changed == 0 {
            return Err(ProgressError::NotFound(format!("user not found: {user_id}")));
        }
        Ok(())
    }
}

fn require_actor(
    conn: &Connection,
    actor_id: UserId,
    capability: Capability,
) -> Result<UserAccount, ProgressError> {
    let actor = query_user(conn, actor_id)?
        .ok_or_else(|| ProgressError::NotFound(format!("actor not found: {actor_id}")))?;
    ensure_capability(actor.role, capability)?;
    Ok(actor)
}

fn insert_new_lab(conn: &Connection, draft: LabDraft) -> Result<Lab, ProgressError> {
    ensure_prerequisites_exist(conn, &draft.prerequisites)?;
    // Dangling refs left by deleted labs can point at a recreated ref.
    let graph = query_prerequisite_graph(conn)?;
    ensure_acyclic(&draft.lab_ref, &draft.prerequisites, &graph)?;

    let lab = draft.into_lab(now_utc());
    conn.execute(
        &format!("INSERT INTO labs({LAB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            lab.lab_ref.as_str(),
            lab.name,
            lab.description,
            lab.sequence_order,
            lab.category,
            lab.max_score,
            bool_to_sql(lab.has_bonus_challenge),
            lab.max_bonus_points,
            bool_to_sql(lab.is_active),
            format_rfc3339(lab.created_at)?,
        ],
    )
    .map_err(storage_error)?;
    replace_prerequisites(conn, &lab.lab_ref, &lab.prerequisites)?;
    Ok(lab)
}

fn ensure_prerequisites_exist(
    conn: &Connection,
    prerequisites: &PrerequisiteSet,
) -> Result<(), ProgressError> {
    for prerequisite in prerequisites {
        if !lab_exists(conn, prerequisite)? {
            return Err(ProgressError::Validation(format!(
                "prerequisite lab '{prerequisite}' not found"
            )));
        }
    }
    Ok(())
}

fn replace_prerequisites(
    conn: &Connection,
    lab_ref: &LabRef,
    prerequisites: &PrerequisiteSet,
) -> Result<(), ProgressError> {
    conn.execute(
        "DELETE FROM lab_prerequisites WHERE lab_ref = ?1",
        params![lab_ref.as_str()],
    )
    .map_err(storage_error)?;

    for (position, prerequisite) in prerequisites.iter().enumerate() {
        let position = i64::try_from(position)
            .map_err(|_| ProgressError::Validation("too many prerequisites".to_string()))?;
        conn.execute(
            "INSERT INTO lab_prerequisites(lab_ref, position, prerequisite_ref) VALUES (?1, ?2, ?3)",
            params![lab_ref.as_str(), position, prerequisite.as_str()],
        )
        .map_err(storage_error)?;
    }
    Ok(())
}

fn lab_exists(conn: &Connection, lab_ref: &LabRef) -> Result<bool, ProgressError> {
    conn.query_row(
        "SELECT 1 FROM labs WHERE lab_ref = ?1",
        params![lab_ref.as_str()],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(storage_error)
}

fn query_user(conn: &Connection, user_id: UserId) -> Result<Option<UserAccount>, ProgressError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
        params![user_id.to_string()],
        parse_user_row,
    )
    .optional()
    .map_err(storage_error)
}

fn query_lab(conn: &Connection, lab_ref: &LabRef) -> Result<Option<Lab>, ProgressError> {
    let lab = conn
        .query_row(
            &format!("SELECT {LAB_COLUMNS} FROM labs WHERE lab_ref = ?1"),
            params![lab_ref.as_str()],
            parse_lab_row,
        )
        .optional()
        .map_err(storage_error)?;

    let Some(mut lab) = lab else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT prerequisite_ref FROM lab_prerequisites
             WHERE lab_ref = ?1
             ORDER BY position ASC",
        )
        .map_err(storage_error)?;
    let rows = stmt
        .query_map(params![lab_ref.as_str()], |row| parse_lab_ref_column(row, 0))
        .map_err(storage_error)?;
    lab.prerequisites = PrerequisiteSet::from_refs(collect_rows(rows)?);
    Ok(Some(lab))
}

fn query_active_labs(conn: &Connection) -> Result<Vec<Lab>, ProgressError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {LAB_COLUMNS} FROM labs
             WHERE is_active = 1
             ORDER BY sequence_order ASC, lab_ref ASC"
        ))
        .map_err(storage_error)?;
    let rows = stmt.query_map([], parse_lab_row).map_err(storage_error)?;
    let mut labs = collect_rows(rows)?;

    let mut graph = query_prerequisite_graph(conn)?;
    for lab in &mut labs {
        if let Some(prerequisites) = graph.remove(&lab.lab_ref) {
            lab.prerequisites = prerequisites;
        }
    }
    Ok(labs)
}

fn query_prerequisite_graph(
    conn: &Connection,
) -> Result<BTreeMap<LabRef, PrerequisiteSet>, ProgressError> {
    let mut stmt = conn
        .prepare(
            "SELECT lab_ref, prerequisite_ref FROM lab_prerequisites
             ORDER BY lab_ref ASC, position ASC",
        )
        .map_err(storage_error)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((parse_lab_ref_column(row, 0)?, parse_lab_ref_column(row, 1)?))
        })
        .map_err(storage_error)?;

    let mut edges: BTreeMap<LabRef, Vec<LabRef>> = BTreeMap::new();
    for (lab_ref, prerequisite) in collect_rows(rows)? {
        edges.entry(lab_ref).or_default().push(prerequisite);
    }

    Ok(edges
        .into_iter()
        .map(|(lab_ref, refs)| (lab_ref, PrerequisiteSet::from_refs(refs)))
        .collect())
}

fn parse_lab_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lab> {
    Ok(Lab {
        lab_ref: parse_lab_ref_column(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        sequence_order: row.get(3)?,
        category: row.get(4)?,
        prerequisites: PrerequisiteSet::default(),
        max_score: row.get(5)?,
        has_bonus_challenge: row.get::<_, i64>(6)? == 1,
        max_bonus_points: row.get(7)?,
        is_active: row.get::<_, i64>(8)? == 1,
        created_at: parse_timestamp_column(row, 9)?,
    })
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserAccount> {
    let role_raw: String = row.get(4)?;
    let rank_raw: String = row.get(6)?;

    let role = UserRole::parse(&role_raw)
        .ok_or_else(|| invalid_column(4, Type::Text, format!("invalid role: {role_raw}")))?;
    let rank = Rank::parse(&rank_raw)
        .ok_or_else(|| invalid_column(6, Type::Text, format!("invalid rank: {rank_raw}")))?;

    Ok(UserAccount {
        user_id: parse_user_id_column(row, 0)?,
        email: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        role,
        is_active: row.get::<_, i64>(5)? == 1,
        rank,
        total_score: row.get(7)?,
        total_bonus_points: row.get(8)?,
        created_at: parse_timestamp_column(row, 9)?,
    })
}

fn parse_progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressRecord> {
    let status_raw: String = row.get(2)?;
    let attempts_i64: i64 = row.get(5)?;

    let status = ProgressStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(2, Type::Text, format!("invalid status: {status_raw}")))?;
    let attempts = u32::try_from(attempts_i64).map_err(|_| {
        invalid_column(5, Type::Integer, format!("invalid attempts: {attempts_i64}"))
    })?;

    Ok(ProgressRecord {
        user_id: parse_user_id_column(row, 0)?,
        lab_ref: parse_lab_ref_column(row, 1)?,
        status,
        score: row.get(3)?,
        bonus_points: row.get(4)?,
        attempts,
        started_at: parse_optional_timestamp_column(row, 6)?,
        last_activity: parse_optional_timestamp_column(row, 7)?,
        completed_at: parse_optional_timestamp_column(row, 8)?,
        instructor_notes: row.get(9)?,
        score_overridden: row.get::<_, i64>(10)? == 1,
    })
}

fn parse_user_id_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<UserId> {
    let raw: String = row.get(index)?;
    raw.parse::<UserId>()
        .map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_lab_ref_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<LabRef> {
    let raw: String = row.get(index)?;
    LabRef::parse(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_timestamp_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_optional_timestamp_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        parse_rfc3339_utc(&value).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
    })
    .transpose()
}

fn optional_timestamp(value: Option<OffsetDateTime>) -> Result<Option<String>, ProgressError> {
    value.map(format_rfc3339).transpose()
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn storage_error(err: rusqlite::Error) -> ProgressError {
    ProgressError::Storage(err.to_string())
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, ProgressError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(storage_error)?);
    }
    Ok(values)
}
