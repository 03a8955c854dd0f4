//! Lab progression domain: prerequisite resolution, rank aggregation and the
//! start/complete/override state machine.
//!
//! Everything here is synchronous and storage-agnostic. Persistence is
//! reached through [`ProgressLedger`], which a host implements over a single
//! unit of work (for example one `SQLite` transaction).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const PROGRESS_SNAPSHOT_CONTRACT: &str = "progress_snapshot.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProgressError {
    /// Stable machine-readable code for error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "progress.not_found",
            Self::Forbidden(_) => "progress.forbidden",
            Self::InvalidState(_) => "progress.invalid_state",
            Self::Validation(_) => "progress.validation",
            Self::Configuration(_) => "progress.configuration",
            Self::Storage(_) => "progress.storage",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ProgressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| ProgressError::Validation(format!("invalid user id `{value}`: {err}")))
    }
}

/// Stable string identifier of a lab, used in URLs and prerequisite lists.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct LabRef(String);

impl LabRef {
    pub const MAX_LEN: usize = 64;

    /// Parses and normalizes a lab ref.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when the ref is empty, longer
    /// than [`LabRef::MAX_LEN`] or contains whitespace.
    pub fn parse(raw: &str) -> Result<Self, ProgressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProgressError::Validation(
                "lab ref MUST be non-empty".to_string(),
            ));
        }

        if trimmed.len() > Self::MAX_LEN {
            return Err(ProgressError::Validation(format!(
                "lab ref MUST be at most {} characters",
                Self::MAX_LEN
            )));
        }

        if trimmed.chars().any(char::is_whitespace) {
            return Err(ProgressError::Validation(format!(
                "lab ref `{trimmed}` MUST NOT contain whitespace"
            )));
        }

        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LabRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LabRef {
    type Err = ProgressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for LabRef {
    type Error = ProgressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LabRef> for String {
    fn from(value: LabRef) -> Self {
        value.0
    }
}

/// Ordered, de-duplicated set of prerequisite lab refs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "Vec<LabRef>", into = "Vec<LabRef>")]
pub struct PrerequisiteSet(Vec<LabRef>);

impl PrerequisiteSet {
    #[must_use]
    pub fn from_refs<I>(refs: I) -> Self
    where
        I: IntoIterator<Item = LabRef>,
    {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for lab_ref in refs {
            if seen.insert(lab_ref.clone()) {
                ordered.push(lab_ref);
            }
        }
        Self(ordered)
    }

    /// Parses raw ref strings into a prerequisite set.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when any ref is malformed.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, ProgressError> {
        let refs = raw
            .iter()
            .map(|value| LabRef::parse(value.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_refs(refs))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn contains(&self, lab_ref: &LabRef) -> bool {
        self.0.contains(lab_ref)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LabRef> {
        self.0.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[LabRef] {
        &self.0
    }
}

impl From<Vec<LabRef>> for PrerequisiteSet {
    fn from(value: Vec<LabRef>) -> Self {
        Self::from_refs(value)
    }
}

impl From<PrerequisiteSet> for Vec<LabRef> {
    fn from(value: PrerequisiteSet) -> Self {
        value.0
    }
}

impl<'a> IntoIterator for &'a PrerequisiteSet {
    type Item = &'a LabRef;
    type IntoIter = std::slice::Iter<'a, LabRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Instructor,
    Ta,
    Admin,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Instructor => "instructor",
            Self::Ta => "ta",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(Self::Student),
            "instructor" => Some(Self::Instructor),
            "ta" => Some(Self::Ta),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ManageCatalog,
    ViewAnyProgress,
    OverrideScores,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManageCatalog => "manage_catalog",
            Self::ViewAnyProgress => "view_any_progress",
            Self::OverrideScores => "override_scores",
        }
    }

    #[must_use]
    pub fn allows(self, role: UserRole) -> bool {
        match self {
            Self::ManageCatalog => matches!(role, UserRole::Admin),
            Self::ViewAnyProgress | Self::OverrideScores => {
                matches!(role, UserRole::Admin | UserRole::Instructor)
            }
        }
    }
}

/// Checks that `role` grants `capability`.
///
/// # Errors
/// Returns [`ProgressError::Forbidden`] when the role lacks the capability.
pub fn ensure_capability(role: UserRole, capability: Capability) -> Result<(), ProgressError> {
    if capability.allows(role) {
        return Ok(());
    }

    Err(ProgressError::Forbidden(format!(
        "role `{}` lacks capability `{}`",
        role.as_str(),
        capability.as_str()
    )))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Locked,
    Unlocked,
    InProgress,
    Completed,
}

impl ProgressStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "locked" => Some(Self::Locked),
            "unlocked" => Some(Self::Unlocked),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether `complete` may be applied from this status.
    #[must_use]
    pub fn accepts_completion(self) -> bool {
        matches!(self, Self::InProgress | Self::Completed)
    }
}

/// Progression tiers, lowest first.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    #[default]
    Dabbler,
    Hobbyist,
    Enthusiast,
    Explorer,
    Apprentice,
    Researcher,
    Master,
}

impl Rank {
    pub const ALL: [Self; 7] = [
        Self::Dabbler,
        Self::Hobbyist,
        Self::Enthusiast,
        Self::Explorer,
        Self::Apprentice,
        Self::Researcher,
        Self::Master,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dabbler => "dabbler",
            Self::Hobbyist => "hobbyist",
            Self::Enthusiast => "enthusiast",
            Self::Explorer => "explorer",
            Self::Apprentice => "apprentice",
            Self::Researcher => "researcher",
            Self::Master => "master",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|rank| rank.as_str() == value)
    }

    /// Maps a completion ratio onto a tier with round-half-to-even.
    ///
    /// With seven tiers and 100 labs, 5 completions stay `dabbler`
    /// (`round(0.3) = 0`), 15 reach `hobbyist` (`round(0.9) = 1`) and 75
    /// stay `apprentice` (`round(4.5) = 4`).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn for_completion(completed: usize, total_active_labs: usize) -> Self {
        if total_active_labs == 0 {
            return Self::ALL[0];
        }

        let top = Self::ALL.len() - 1;
        let scaled = (completed as f64 * top as f64) / total_active_labs as f64;
        let rounded = scaled.round_ties_even();
        let index = if rounded <= 0.0 {
            0
        } else {
            (rounded as usize).min(top)
        };
        Self::ALL[index]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lab {
    pub lab_ref: LabRef,
    pub name: String,
    pub description: String,
    pub sequence_order: i64,
    pub category: String,
    pub prerequisites: PrerequisiteSet,
    pub max_score: f64,
    pub has_bonus_challenge: bool,
    pub max_bonus_points: f64,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Lab {
    /// Validates field-level catalog invariants.
    ///
    /// Prerequisite existence and acyclicity need the whole catalog and are
    /// checked by the store through [`ensure_acyclic`].
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] on the first violated invariant.
    pub fn validate(&self) -> Result<(), ProgressError> {
        validate_lab_fields(
            &self.lab_ref,
            &self.name,
            &self.prerequisites,
            self.max_score,
            self.has_bonus_challenge,
            self.max_bonus_points,
        )
    }
}

/// Creation payload for a catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabDraft {
    pub lab_ref: LabRef,
    pub name: String,
    pub description: String,
    pub sequence_order: i64,
    pub category: String,
    pub prerequisites: PrerequisiteSet,
    pub max_score: f64,
    pub has_bonus_challenge: bool,
    pub max_bonus_points: f64,
}

impl LabDraft {
    pub const DEFAULT_CATEGORY: &'static str = "Uncategorized";
    pub const DEFAULT_MAX_SCORE: f64 = 100.0;

    #[must_use]
    pub fn new(lab_ref: LabRef, name: impl Into<String>, sequence_order: i64) -> Self {
        Self {
            lab_ref,
            name: name.into(),
            description: String::new(),
            sequence_order,
            category: Self::DEFAULT_CATEGORY.to_string(),
            prerequisites: PrerequisiteSet::default(),
            max_score: Self::DEFAULT_MAX_SCORE,
            has_bonus_challenge: false,
            max_bonus_points: 0.0,
        }
    }

    /// # Errors
    /// Returns [`ProgressError::Validation`] on the first violated invariant.
    pub fn validate(&self) -> Result<(), ProgressError> {
        validate_lab_fields(
            &self.lab_ref,
            &self.name,
            &self.prerequisites,
            self.max_score,
            self.has_bonus_challenge,
            self.max_bonus_points,
        )
    }

    #[must_use]
    pub fn into_lab(self, created_at: OffsetDateTime) -> Lab {
        Lab {
            lab_ref: self.lab_ref,
            name: self.name,
            description: self.description,
            sequence_order: self.sequence_order,
            category: self.category,
            prerequisites: self.prerequisites,
            max_score: self.max_score,
            has_bonus_challenge: self.has_bonus_challenge,
            max_bonus_points: self.max_bonus_points,
            is_active: true,
            created_at,
        }
    }
}

/// Partial update of a catalog entry; absent fields stay unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub sequence_order: Option<i64>,
    pub category: Option<String>,
    pub prerequisites: Option<PrerequisiteSet>,
    pub max_score: Option<f64>,
    pub has_bonus_challenge: Option<bool>,
    pub max_bonus_points: Option<f64>,
    pub is_active: Option<bool>,
}

impl LabPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    #[must_use]
    pub fn apply(&self, lab: &Lab) -> Lab {
        let mut updated = lab.clone();
        if let Some(name) = &self.name {
            updated.name.clone_from(name);
        }
        if let Some(description) = &self.description {
            updated.description.clone_from(description);
        }
        if let Some(sequence_order) = self.sequence_order {
            updated.sequence_order = sequence_order;
        }
        if let Some(category) = &self.category {
            updated.category.clone_from(category);
        }
        if let Some(prerequisites) = &self.prerequisites {
            updated.prerequisites = prerequisites.clone();
        }
        if let Some(max_score) = self.max_score {
            updated.max_score = max_score;
        }
        if let Some(has_bonus_challenge) = self.has_bonus_challenge {
            updated.has_bonus_challenge = has_bonus_challenge;
        }
        if let Some(max_bonus_points) = self.max_bonus_points {
            updated.max_bonus_points = max_bonus_points;
        }
        if let Some(is_active) = self.is_active {
            updated.is_active = is_active;
        }
        updated
    }
}

fn validate_lab_fields(
    lab_ref: &LabRef,
    name: &str,
    prerequisites: &PrerequisiteSet,
    max_score: f64,
    has_bonus_challenge: bool,
    max_bonus_points: f64,
) -> Result<(), ProgressError> {
    if name.trim().is_empty() {
        return Err(ProgressError::Validation(
            "lab name MUST be non-empty".to_string(),
        ));
    }

    if !max_score.is_finite() || max_score <= 0.0 {
        return Err(ProgressError::Validation(
            "max_score MUST be a finite number > 0".to_string(),
        ));
    }

    if !max_bonus_points.is_finite() || max_bonus_points < 0.0 {
        return Err(ProgressError::Validation(
            "max_bonus_points MUST be a finite number >= 0".to_string(),
        ));
    }

    if !has_bonus_challenge && max_bonus_points > 0.0 {
        return Err(ProgressError::Validation(
            "max_bonus_points MUST be 0 when the bonus challenge is disabled".to_string(),
        ));
    }

    if prerequisites.contains(lab_ref) {
        return Err(ProgressError::Validation(format!(
            "lab `{lab_ref}` cannot list itself as a prerequisite"
        )));
    }

    Ok(())
}

/// Rejects a prerequisite assignment that would close a cycle.
///
/// `graph` maps every other catalog lab to its current prerequisites; the
/// entry for `lab_ref` itself, if present, is ignored.
///
/// # Errors
/// Returns [`ProgressError::Validation`] naming the prerequisite through
/// which `lab_ref` would reach itself.
pub fn ensure_acyclic(
    lab_ref: &LabRef,
    prerequisites: &PrerequisiteSet,
    graph: &BTreeMap<LabRef, PrerequisiteSet>,
) -> Result<(), ProgressError> {
    for start in prerequisites {
        let mut visited = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if current == lab_ref {
                return Err(ProgressError::Validation(format!(
                    "prerequisite `{start}` would create a cycle through `{lab_ref}`"
                )));
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = graph.get(current) {
                stack.extend(next.iter());
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub user_id: UserId,
    pub lab_ref: LabRef,
    pub status: ProgressStatus,
    pub score: Option<f64>,
    pub bonus_points: f64,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_activity: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub instructor_notes: Option<String>,
    pub score_overridden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
}

impl NewUser {
    /// # Errors
    /// Returns [`ProgressError::Validation`] for a malformed email or empty
    /// name fields.
    pub fn validate(&self) -> Result<(), ProgressError> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ProgressError::Validation(format!(
                "email `{email}` is not a valid address"
            )));
        }

        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(ProgressError::Validation(
                "first_name and last_name MUST be non-empty".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn into_account(self, user_id: UserId, created_at: OffsetDateTime) -> UserAccount {
        UserAccount {
            user_id,
            email: self.email.trim().to_string(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            role: self.role,
            is_active: true,
            rank: Rank::default(),
            total_score: 0.0,
            total_bonus_points: 0.0,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAccount {
    pub user_id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    pub is_active: bool,
    pub rank: Rank,
    pub total_score: f64,
    pub total_bonus_points: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Denormalized per-user aggregate, always recomputed from the full ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UserTotals {
    pub rank: Rank,
    pub total_score: f64,
    pub total_bonus_points: f64,
}

/// What the resolver knows about one prerequisite of one user.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PrerequisiteState {
    /// The referenced lab no longer exists in the catalog.
    Retired,
    /// The lab exists; `None` means the user has no record for it.
    Tracked(Option<ProgressStatus>),
}

pub trait PrerequisiteLookup {
    /// # Errors
    /// Returns [`ProgressError::Storage`] when the backing lookup fails.
    fn prerequisite_state(
        &self,
        user_id: UserId,
        prerequisite: &LabRef,
    ) -> Result<PrerequisiteState, ProgressError>;
}

/// Lists the prerequisites of `lab` that `user_id` has not completed, in
/// prerequisite order.
///
/// Refs that no longer resolve to a catalog lab are skipped rather than
/// failing, so soft-deleted labs do not strand their dependents.
///
/// # Errors
/// Propagates lookup failures.
pub fn unmet_prerequisites<L>(
    user_id: UserId,
    lab: &Lab,
    lookup: &L,
) -> Result<Vec<LabRef>, ProgressError>
where
    L: PrerequisiteLookup + ?Sized,
{
    let mut unmet = Vec::new();
    for prerequisite in &lab.prerequisites {
        match lookup.prerequisite_state(user_id, prerequisite)? {
            PrerequisiteState::Retired => {
                tracing::debug!(
                    lab_ref = %lab.lab_ref,
                    prerequisite = %prerequisite,
                    "treating prerequisite missing from catalog as satisfied"
                );
            }
            PrerequisiteState::Tracked(Some(ProgressStatus::Completed)) => {}
            PrerequisiteState::Tracked(_) => unmet.push(prerequisite.clone()),
        }
    }
    Ok(unmet)
}

/// Whether every prerequisite of `lab` is completed by `user_id`.
///
/// # Errors
/// Propagates lookup failures.
pub fn is_reachable<L>(user_id: UserId, lab: &Lab, lookup: &L) -> Result<bool, ProgressError>
where
    L: PrerequisiteLookup + ?Sized,
{
    for prerequisite in &lab.prerequisites {
        match lookup.prerequisite_state(user_id, prerequisite)? {
            PrerequisiteState::Retired
            | PrerequisiteState::Tracked(Some(ProgressStatus::Completed)) => {}
            PrerequisiteState::Tracked(_) => return Ok(false),
        }
    }
    Ok(true)
}

/// Persisted status when a record exists, otherwise locked/unlocked from
/// reachability.
#[must_use]
pub fn derive_status(record: Option<&ProgressRecord>, reachable: bool) -> ProgressStatus {
    match record {
        Some(record) => record.status,
        None if reachable => ProgressStatus::Unlocked,
        None => ProgressStatus::Locked,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Accessibility {
    pub lab_ref: LabRef,
    pub accessible: bool,
    pub missing_prerequisites: Vec<LabRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Accessibility {
    #[must_use]
    pub fn from_unmet(lab_ref: LabRef, missing_prerequisites: Vec<LabRef>) -> Self {
        let reason = (!missing_prerequisites.is_empty()).then(|| {
            format!(
                "Complete {} prerequisite lab(s) first",
                missing_prerequisites.len()
            )
        });
        Self {
            lab_ref,
            accessible: missing_prerequisites.is_empty(),
            missing_prerequisites,
            reason,
        }
    }
}

/// Preloaded view of one user's ledger for batch status derivation.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    user_id: UserId,
    catalog: BTreeSet<LabRef>,
    records: BTreeMap<LabRef, ProgressRecord>,
}

impl LedgerSnapshot {
    /// `catalog` must list every existing lab, active or not; records of
    /// other users are dropped.
    #[must_use]
    pub fn new<I>(user_id: UserId, catalog: I, records: Vec<ProgressRecord>) -> Self
    where
        I: IntoIterator<Item = LabRef>,
    {
        let records = records
            .into_iter()
            .filter(|record| record.user_id == user_id)
            .map(|record| (record.lab_ref.clone(), record))
            .collect();
        Self {
            user_id,
            catalog: catalog.into_iter().collect(),
            records,
        }
    }

    #[must_use]
    pub fn record(&self, lab_ref: &LabRef) -> Option<&ProgressRecord> {
        self.records.get(lab_ref)
    }
}

impl PrerequisiteLookup for LedgerSnapshot {
    fn prerequisite_state(
        &self,
        user_id: UserId,
        prerequisite: &LabRef,
    ) -> Result<PrerequisiteState, ProgressError> {
        if user_id != self.user_id {
            return Err(ProgressError::Configuration(format!(
                "ledger snapshot holds user {} but was asked about {user_id}",
                self.user_id
            )));
        }

        if !self.catalog.contains(prerequisite) {
            return Ok(PrerequisiteState::Retired);
        }

        Ok(PrerequisiteState::Tracked(
            self.records.get(prerequisite).map(|record| record.status),
        ))
    }
}

/// Recomputes rank and totals from a user's complete ledger.
#[must_use]
pub fn recompute_totals(records: &[ProgressRecord], total_active_labs: usize) -> UserTotals {
    let completed = records
        .iter()
        .filter(|record| record.status == ProgressStatus::Completed)
        .count();
    let total_score = records.iter().filter_map(|record| record.score).sum();
    let total_bonus_points = records.iter().map(|record| record.bonus_points).sum();

    UserTotals {
        rank: Rank::for_completion(completed, total_active_labs),
        total_score,
        total_bonus_points,
    }
}

/// Score and bonus submitted when completing a lab.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub score: f64,
    #[serde(default)]
    pub bonus_points: f64,
}

impl Completion {
    /// Checks the submission against the lab's inclusive bounds.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] naming the violated bound.
    pub fn validate_against(&self, lab: &Lab) -> Result<(), ProgressError> {
        if !self.score.is_finite() || self.score < 0.0 || self.score > lab.max_score {
            return Err(ProgressError::Validation(format!(
                "score must be between 0 and {}",
                lab.max_score
            )));
        }

        if !self.bonus_points.is_finite()
            || self.bonus_points < 0.0
            || self.bonus_points > lab.max_bonus_points
        {
            return Err(ProgressError::Validation(format!(
                "bonus points must be between 0 and {}",
                lab.max_bonus_points
            )));
        }

        Ok(())
    }
}

/// Administrative correction; absent fields stay unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoreOverride {
    pub score: Option<f64>,
    pub bonus_points: Option<f64>,
    pub instructor_notes: Option<String>,
}

/// Applies the start transition to the existing record, if any.
///
/// Prerequisites are not checked here; [`start_lab`] does that first.
#[must_use]
pub fn plan_start(
    user_id: UserId,
    lab: &Lab,
    existing: Option<ProgressRecord>,
    now: OffsetDateTime,
) -> ProgressRecord {
    let Some(mut record) = existing else {
        return ProgressRecord {
            user_id,
            lab_ref: lab.lab_ref.clone(),
            status: ProgressStatus::InProgress,
            score: Some(0.0),
            bonus_points: 0.0,
            attempts: 1,
            started_at: Some(now),
            last_activity: Some(now),
            completed_at: None,
            instructor_notes: None,
            score_overridden: false,
        };
    };

    match record.status {
        // Retakes keep the previous score and bonus until the next completion.
        ProgressStatus::Completed | ProgressStatus::Locked | ProgressStatus::Unlocked => {
            record.attempts = record.attempts.saturating_add(1);
            record.status = ProgressStatus::InProgress;
        }
        ProgressStatus::InProgress => {}
    }
    record.last_activity = Some(now);

    if record.started_at.is_none() {
        record.started_at = Some(now);
    }

    record
}

/// Applies the complete transition, validating fully before mutating.
///
/// # Errors
/// Returns [`ProgressError::InvalidState`] when no record exists or the
/// record was never started, and [`ProgressError::Validation`] when score
/// or bonus fall outside the lab's bounds.
pub fn plan_completion(
    lab: &Lab,
    existing: Option<ProgressRecord>,
    completion: &Completion,
    now: OffsetDateTime,
) -> Result<ProgressRecord, ProgressError> {
    let Some(mut record) = existing else {
        return Err(ProgressError::InvalidState(format!(
            "lab not started: {}",
            lab.lab_ref
        )));
    };

    if !record.status.accepts_completion() {
        return Err(ProgressError::InvalidState(format!(
            "lab must be started before completion (status is {})",
            record.status.as_str()
        )));
    }

    completion.validate_against(lab)?;

    record.status = ProgressStatus::Completed;
    record.score = Some(completion.score);
    record.bonus_points = completion.bonus_points;
    record.completed_at = Some(now);
    record.last_activity = Some(now);
    Ok(record)
}

/// Applies an administrative override without bounds checks.
///
/// # Errors
/// Returns [`ProgressError::NotFound`] when no record exists.
pub fn plan_override(
    lab_ref: &LabRef,
    existing: Option<ProgressRecord>,
    change: &ScoreOverride,
) -> Result<ProgressRecord, ProgressError> {
    let Some(mut record) = existing else {
        return Err(ProgressError::NotFound(format!(
            "no progress record found for this lab: {lab_ref}"
        )));
    };

    if let Some(score) = change.score {
        record.score = Some(score);
        record.score_overridden = true;
    }
    if let Some(bonus_points) = change.bonus_points {
        record.bonus_points = bonus_points;
    }
    if let Some(notes) = &change.instructor_notes {
        record.instructor_notes = Some(notes.clone());
    }

    Ok(record)
}

/// Storage seam for one unit of work.
///
/// Implementations are expected to run every call of a single operation
/// inside the same transaction so the read-decide-write sequence is atomic.
pub trait ProgressLedger: PrerequisiteLookup {
    /// # Errors
    /// Returns [`ProgressError::Storage`] when the read fails.
    fn lab_by_ref(&self, lab_ref: &LabRef) -> Result<Option<Lab>, ProgressError>;

    /// Active labs ordered by `(sequence_order, lab_ref)`.
    ///
    /// # Errors
    /// Returns [`ProgressError::Storage`] when the read fails.
    fn list_active_labs(&self) -> Result<Vec<Lab>, ProgressError>;

    /// Refs of every lab in the catalog, active or not.
    ///
    /// # Errors
    /// Returns [`ProgressError::Storage`] when the read fails.
    fn catalog_refs(&self) -> Result<Vec<LabRef>, ProgressError>;

    /// # Errors
    /// Returns [`ProgressError::Storage`] when the read fails.
    fn user(&self, user_id: UserId) -> Result<Option<UserAccount>, ProgressError>;

    /// # Errors
    /// Returns [`ProgressError::Storage`] when the read fails.
    fn progress(
        &self,
        user_id: UserId,
        lab_ref: &LabRef,
    ) -> Result<Option<ProgressRecord>, ProgressError>;

    /// # Errors
    /// Returns [`ProgressError::Storage`] when the read fails.
    fn list_progress_for_user(&self, user_id: UserId)
        -> Result<Vec<ProgressRecord>, ProgressError>;

    /// # Errors
    /// Returns [`ProgressError::Storage`] when the write fails.
    fn upsert_progress(&mut self, record: &ProgressRecord) -> Result<(), ProgressError>;

    /// # Errors
    /// Returns [`ProgressError::Storage`] when the write fails.
    fn update_user_totals(
        &mut self,
        user_id: UserId,
        totals: &UserTotals,
    ) -> Result<(), ProgressError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartOutcome {
    pub lab_ref: LabRef,
    pub status: ProgressStatus,
    pub attempts: u32,
    pub score: Option<f64>,
    pub bonus_points: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionOutcome {
    pub lab_ref: LabRef,
    pub status: ProgressStatus,
    pub score: Option<f64>,
    pub bonus_points: f64,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub user_rank: Rank,
    pub user_total_score: f64,
    pub user_total_bonus_points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverrideOutcome {
    pub user_id: UserId,
    pub lab_ref: LabRef,
    pub score: Option<f64>,
    pub bonus_points: f64,
    pub instructor_notes: Option<String>,
    pub score_overridden: bool,
    pub user_rank: Rank,
    pub user_total_score: f64,
    pub user_total_bonus_points: f64,
}

/// Starts (or resumes, or retakes) a lab for a user.
///
/// # Errors
/// [`ProgressError::NotFound`] for an unknown user or lab,
/// [`ProgressError::Forbidden`] when prerequisites are unmet, and storage
/// failures from the ledger.
pub fn start_lab<L>(
    ledger: &mut L,
    user_id: UserId,
    lab_ref: &LabRef,
    now: OffsetDateTime,
) -> Result<StartOutcome, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    require_user(&*ledger, user_id)?;
    let lab = require_lab(&*ledger, lab_ref)?;

    let unmet = unmet_prerequisites(user_id, &lab, &*ledger)?;
    if !unmet.is_empty() {
        return Err(ProgressError::Forbidden(format!(
            "prerequisites not met for lab {lab_ref}: complete {} first",
            join_refs(&unmet)
        )));
    }

    let existing = ledger.progress(user_id, lab_ref)?;
    let record = plan_start(user_id, &lab, existing, now);
    ledger.upsert_progress(&record)?;

    tracing::info!(
        user_id = %user_id,
        lab_ref = %lab_ref,
        attempts = record.attempts,
        "lab started"
    );

    Ok(StartOutcome {
        lab_ref: record.lab_ref,
        status: record.status,
        attempts: record.attempts,
        score: record.score,
        bonus_points: record.bonus_points,
        started_at: record.started_at,
    })
}

/// Completes a started lab and refreshes the user's aggregate.
///
/// # Errors
/// [`ProgressError::NotFound`] for an unknown user or lab,
/// [`ProgressError::InvalidState`] when the lab was not started,
/// [`ProgressError::Validation`] for out-of-bounds score or bonus, and
/// storage failures from the ledger.
pub fn complete_lab<L>(
    ledger: &mut L,
    user_id: UserId,
    lab_ref: &LabRef,
    completion: &Completion,
    now: OffsetDateTime,
) -> Result<CompletionOutcome, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    require_user(&*ledger, user_id)?;
    let lab = require_lab(&*ledger, lab_ref)?;

    let existing = ledger.progress(user_id, lab_ref)?;
    let record = plan_completion(&lab, existing, completion, now)?;
    ledger.upsert_progress(&record)?;
    let totals = refresh_user_totals(ledger, user_id)?;

    tracing::info!(
        user_id = %user_id,
        lab_ref = %lab_ref,
        score = completion.score,
        bonus_points = completion.bonus_points,
        rank = totals.rank.as_str(),
        "lab completed"
    );

    Ok(CompletionOutcome {
        lab_ref: record.lab_ref,
        status: record.status,
        score: record.score,
        bonus_points: record.bonus_points,
        attempts: record.attempts,
        completed_at: record.completed_at,
        user_rank: totals.rank,
        user_total_score: totals.total_score,
        user_total_bonus_points: totals.total_bonus_points,
    })
}

/// Applies an instructor/admin override and refreshes the user's aggregate.
///
/// Score and bonus are not bounds-checked on this path.
///
/// # Errors
/// [`ProgressError::Forbidden`] when the actor lacks
/// [`Capability::OverrideScores`], [`ProgressError::NotFound`] for an
/// unknown actor, user, lab or progress record, and storage failures.
pub fn override_progress<L>(
    ledger: &mut L,
    actor_id: UserId,
    user_id: UserId,
    lab_ref: &LabRef,
    change: &ScoreOverride,
) -> Result<OverrideOutcome, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    let actor = require_user(&*ledger, actor_id)?;
    ensure_capability(actor.role, Capability::OverrideScores)?;
    require_user(&*ledger, user_id)?;
    require_lab(&*ledger, lab_ref)?;

    let existing = ledger.progress(user_id, lab_ref)?;
    let record = plan_override(lab_ref, existing, change)?;
    ledger.upsert_progress(&record)?;
    let totals = refresh_user_totals(ledger, user_id)?;

    tracing::info!(
        actor_id = %actor_id,
        user_id = %user_id,
        lab_ref = %lab_ref,
        score_overridden = record.score_overridden,
        "progress overridden"
    );

    Ok(OverrideOutcome {
        user_id,
        lab_ref: record.lab_ref,
        score: record.score,
        bonus_points: record.bonus_points,
        instructor_notes: record.instructor_notes,
        score_overridden: record.score_overridden,
        user_rank: totals.rank,
        user_total_score: totals.total_score,
        user_total_bonus_points: totals.total_bonus_points,
    })
}

/// Re-reads the user's full ledger and persists recomputed totals.
///
/// # Errors
/// Propagates ledger read/write failures.
pub fn refresh_user_totals<L>(ledger: &mut L, user_id: UserId) -> Result<UserTotals, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    let records = ledger.list_progress_for_user(user_id)?;
    let total_active_labs = ledger.list_active_labs()?.len();
    let totals = recompute_totals(&records, total_active_labs);
    ledger.update_user_totals(user_id, &totals)?;
    Ok(totals)
}

/// Reports whether `user_id` may start `lab_ref` and what is missing.
///
/// # Errors
/// [`ProgressError::NotFound`] for an unknown user or lab, and storage
/// failures.
pub fn check_accessibility<L>(
    ledger: &L,
    user_id: UserId,
    lab_ref: &LabRef,
) -> Result<Accessibility, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    require_user(ledger, user_id)?;
    let lab = require_lab(ledger, lab_ref)?;
    let unmet = unmet_prerequisites(user_id, &lab, ledger)?;
    Ok(Accessibility::from_unmet(lab.lab_ref, unmet))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub user_id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    pub rank: Rank,
    pub total_score: f64,
    pub total_bonus_points: f64,
}

impl From<&UserAccount> for UserSummary {
    fn from(value: &UserAccount) -> Self {
        Self {
            user_id: value.user_id,
            email: value.email.clone(),
            first_name: value.first_name.clone(),
            last_name: value.last_name.clone(),
            role: value.role,
            rank: value.rank,
            total_score: value.total_score,
            total_bonus_points: value.total_bonus_points,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressView {
    pub status: ProgressStatus,
    pub score: Option<f64>,
    pub bonus_points: f64,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub instructor_notes: Option<String>,
    pub score_overridden: bool,
}

impl ProgressView {
    #[must_use]
    pub fn resolve(record: Option<&ProgressRecord>, reachable: bool) -> Self {
        let status = derive_status(record, reachable);
        match record {
            Some(record) => Self {
                status,
                score: record.score,
                bonus_points: record.bonus_points,
                attempts: record.attempts,
                started_at: record.started_at,
                completed_at: record.completed_at,
                instructor_notes: record.instructor_notes.clone(),
                score_overridden: record.score_overridden,
            },
            None => Self {
                status,
                score: None,
                bonus_points: 0.0,
                attempts: 0,
                started_at: None,
                completed_at: None,
                instructor_notes: None,
                score_overridden: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabProgressEntry {
    pub lab: Lab,
    pub progress: ProgressView,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub contract_version: String,
    pub user: UserSummary,
    pub labs: Vec<LabProgressEntry>,
}

/// Builds the per-lab view of every active lab for `user_id`, merging
/// persisted records with derived locked/unlocked status.
///
/// # Errors
/// [`ProgressError::NotFound`] for an unknown user, and storage failures.
pub fn progress_snapshot<L>(ledger: &L, user_id: UserId) -> Result<ProgressSnapshot, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    let user = require_user(ledger, user_id)?;
    let mut labs = ledger.list_active_labs()?;
    labs.sort_by(|lhs, rhs| {
        (lhs.sequence_order, &lhs.lab_ref).cmp(&(rhs.sequence_order, &rhs.lab_ref))
    });

    let snapshot = LedgerSnapshot::new(
        user_id,
        ledger.catalog_refs()?,
        ledger.list_progress_for_user(user_id)?,
    );

    let mut entries = Vec::with_capacity(labs.len());
    for lab in labs {
        let record = snapshot.record(&lab.lab_ref);
        let reachable = match record {
            Some(_) => true,
            None => is_reachable(user_id, &lab, &snapshot)?,
        };
        let progress = ProgressView::resolve(record, reachable);
        entries.push(LabProgressEntry { lab, progress });
    }

    Ok(ProgressSnapshot {
        contract_version: PROGRESS_SNAPSHOT_CONTRACT.to_string(),
        user: UserSummary::from(&user),
        labs: entries,
    })
}

/// Snapshot of another user's progress for instructors and admins.
///
/// Actors may always view their own progress.
///
/// # Errors
/// [`ProgressError::Forbidden`] when the actor lacks
/// [`Capability::ViewAnyProgress`], plus the errors of [`progress_snapshot`].
pub fn progress_snapshot_as<L>(
    ledger: &L,
    actor_id: UserId,
    user_id: UserId,
) -> Result<ProgressSnapshot, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    let actor = require_user(ledger, actor_id)?;
    if actor_id != user_id {
        ensure_capability(actor.role, Capability::ViewAnyProgress)?;
    }
    progress_snapshot(ledger, user_id)
}

/// Single-lab view for `user_id`.
///
/// # Errors
/// [`ProgressError::NotFound`] for an unknown user or lab, and storage
/// failures.
pub fn lab_progress<L>(
    ledger: &L,
    user_id: UserId,
    lab_ref: &LabRef,
) -> Result<LabProgressEntry, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    require_user(ledger, user_id)?;
    let lab = require_lab(ledger, lab_ref)?;
    let record = ledger.progress(user_id, lab_ref)?;
    let reachable = match record {
        Some(_) => true,
        None => is_reachable(user_id, &lab, ledger)?,
    };
    let progress = ProgressView::resolve(record.as_ref(), reachable);
    Ok(LabProgressEntry { lab, progress })
}

fn require_user<L>(ledger: &L, user_id: UserId) -> Result<UserAccount, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    ledger
        .user(user_id)?
        .ok_or_else(|| ProgressError::NotFound(format!("user not found: {user_id}")))
}

fn require_lab<L>(ledger: &L, lab_ref: &LabRef) -> Result<Lab, ProgressError>
where
    L: ProgressLedger + ?Sized,
{
    ledger
        .lab_by_ref(lab_ref)?
        .ok_or_else(|| ProgressError::NotFound(format!("lab not found: {lab_ref}")))
}

fn join_refs(refs: &[LabRef]) -> String {
    refs.iter()
        .map(LabRef::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProgressError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProgressError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProgressError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProgressError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ProgressError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
