//! Embedded command surface of the `lh` binary.
//!
//! Hosts can drive the same behavior through:
//! - [`run_cli`] for a fully parsed command line.
//! - [`run_command_with_db`] for a single [`Command`] against a database path.
//! - [`run_command`] for a single [`Command`] against an open store.
//!
//! Every successful command prints pretty JSON on stdout. Failures are
//! rendered by [`error_envelope`] as `{"error": {"code", "message"}}`.

#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod seed;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use labhub_progress_core::{
    Completion, LabDraft, LabPatch, LabRef, NewUser, PrerequisiteSet, ProgressError,
    ScoreOverride, UserId, UserRole,
};
use labhub_progress_store_sqlite::SqliteProgressStore;
use serde::Serialize;

use crate::config::Settings;

pub const CLI_ERROR_CODE: &str = "cli.error";

#[derive(Debug, Parser)]
#[command(name = "lh")]
#[command(about = "LabHub progress CLI")]
pub struct Cli {
    /// SQLite database path.
    #[arg(long, env = "LABHUB_DB", global = true)]
    db: Option<PathBuf>,

    /// Optional TOML settings file (`db`, `log_filter`).
    #[arg(long, env = "LABHUB_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Lab {
        #[command(subcommand)]
        command: Box<LabCommand>,
    },
    Progress {
        #[command(subcommand)]
        command: Box<ProgressCommand>,
    },
    Admin {
        #[command(subcommand)]
        command: Box<AdminCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Create(UserCreateArgs),
    Show {
        #[arg(long)]
        user: String,
    },
}

#[derive(Debug, Args)]
pub struct UserCreateArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long, value_enum, default_value_t = RoleArg::Student)]
    role: RoleArg,
}

#[derive(Debug, Subcommand)]
pub enum LabCommand {
    List,
    Show {
        #[arg(long)]
        lab: String,
    },
    Create(LabCreateArgs),
    Update(LabUpdateArgs),
    Delete {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        lab: String,
    },
    Accessible {
        #[arg(long)]
        user: String,
        #[arg(long)]
        lab: String,
    },
    /// Installs the built-in galaxy explorer catalog.
    Seed,
}

#[derive(Debug, Args)]
pub struct LabCreateArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    lab: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    sequence_order: i64,
    #[arg(long, default_value = LabDraft::DEFAULT_CATEGORY)]
    category: String,
    /// Repeat for each prerequisite lab ref, in order.
    #[arg(long = "prerequisite")]
    prerequisites: Vec<String>,
    #[arg(long, default_value_t = LabDraft::DEFAULT_MAX_SCORE)]
    max_score: f64,
    /// Enables the bonus challenge with this many points.
    #[arg(long)]
    max_bonus_points: Option<f64>,
}

#[derive(Debug, Args)]
pub struct LabUpdateArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    lab: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    sequence_order: Option<i64>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long = "prerequisite", conflicts_with = "clear_prerequisites")]
    prerequisites: Vec<String>,
    #[arg(long)]
    clear_prerequisites: bool,
    #[arg(long)]
    max_score: Option<f64>,
    #[arg(long, action = ArgAction::Set)]
    bonus_challenge: Option<bool>,
    #[arg(long)]
    max_bonus_points: Option<f64>,
    #[arg(long, action = ArgAction::Set)]
    active: Option<bool>,
}

#[derive(Debug, Subcommand)]
pub enum ProgressCommand {
    Start {
        #[arg(long)]
        user: String,
        #[arg(long)]
        lab: String,
    },
    Complete {
        #[arg(long)]
        user: String,
        #[arg(long)]
        lab: String,
        #[arg(long)]
        score: f64,
        #[arg(long, default_value_t = 0.0)]
        bonus_points: f64,
    },
    /// Full snapshot, or a single lab with `--lab`.
    Show {
        #[arg(long)]
        user: String,
        #[arg(long)]
        lab: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    UserProgress {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        user: String,
    },
    Override(OverrideArgs),
}

#[derive(Debug, Args)]
pub struct OverrideArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    lab: String,
    #[arg(long)]
    score: Option<f64>,
    #[arg(long)]
    bonus_points: Option<f64>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Student,
    Instructor,
    Ta,
    Admin,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Executes the parsed top-level CLI command graph.
///
/// Resolves settings, installs logging, opens and migrates the database,
/// then runs the command.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = Settings::resolve(cli.db.as_deref(), cli.config.as_deref())?;
    settings.init_tracing();
    run_command_with_db(&settings.db, cli.command)
}

pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteProgressStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

pub fn run_command(command: Command, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        Command::User { command } => run_user(*command, store),
        Command::Lab { command } => run_lab(*command, store),
        Command::Progress { command } => run_progress(*command, store),
        Command::Admin { command } => run_admin(*command, store),
    }
}

fn run_user(command: UserCommand, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        UserCommand::Create(args) => {
            let account = store.create_user(NewUser {
                email: args.email,
                first_name: args.first_name,
                last_name: args.last_name,
                role: map_role(args.role),
            })?;
            print_json(&account)
        }
        UserCommand::Show { user } => print_json(&store.get_user(parse_user_id(&user)?)?),
    }
}

fn run_lab(command: LabCommand, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        LabCommand::List => print_json(&store.list_active_labs()?),
        LabCommand::Show { lab } => print_json(&store.get_lab(&parse_lab_ref(&lab)?)?),
        LabCommand::Create(args) => {
            let actor = parse_user_id(&args.actor)?;
            let mut draft = LabDraft::new(parse_lab_ref(&args.lab)?, args.name, args.sequence_order);
            draft.description = args.description;
            draft.category = args.category;
            draft.prerequisites = PrerequisiteSet::parse(&args.prerequisites)?;
            draft.max_score = args.max_score;
            if let Some(points) = args.max_bonus_points {
                draft.has_bonus_challenge = true;
                draft.max_bonus_points = points;
            }
            print_json(&store.create_lab(actor, draft)?)
        }
        LabCommand::Update(args) => {
            let actor = parse_user_id(&args.actor)?;
            let lab_ref = parse_lab_ref(&args.lab)?;
            let prerequisites = if args.clear_prerequisites {
                Some(PrerequisiteSet::default())
            } else if args.prerequisites.is_empty() {
                None
            } else {
                Some(PrerequisiteSet::parse(&args.prerequisites)?)
            };
            let patch = LabPatch {
                name: args.name,
                description: args.description,
                sequence_order: args.sequence_order,
                category: args.category,
                prerequisites,
                max_score: args.max_score,
                has_bonus_challenge: args.bonus_challenge,
                max_bonus_points: args.max_bonus_points,
                is_active: args.active,
            };
            if patch.is_empty() {
                return Err(ProgressError::Validation("no fields to update".to_string()).into());
            }
            print_json(&store.update_lab(actor, &lab_ref, &patch)?)
        }
        LabCommand::Delete { actor, lab } => {
            print_json(&store.delete_lab(parse_user_id(&actor)?, &parse_lab_ref(&lab)?)?)
        }
        LabCommand::Accessible { user, lab } => print_json(
            &store.check_accessibility(parse_user_id(&user)?, &parse_lab_ref(&lab)?)?,
        ),
        LabCommand::Seed => {
            let drafts = seed::galaxy_catalog()?;
            print_json(&store.seed_catalog(&drafts)?)
        }
    }
}

fn run_progress(command: ProgressCommand, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        ProgressCommand::Start { user, lab } => {
            print_json(&store.start_lab(parse_user_id(&user)?, &parse_lab_ref(&lab)?)?)
        }
        ProgressCommand::Complete {
            user,
            lab,
            score,
            bonus_points,
        } => print_json(&store.complete_lab(
            parse_user_id(&user)?,
            &parse_lab_ref(&lab)?,
            &Completion {
                score,
                bonus_points,
            },
        )?),
        ProgressCommand::Show { user, lab } => {
            let user_id = parse_user_id(&user)?;
            match lab {
                Some(lab) => print_json(&store.lab_progress(user_id, &parse_lab_ref(&lab)?)?),
                None => print_json(&store.progress_snapshot(user_id)?),
            }
        }
    }
}

fn run_admin(command: AdminCommand, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        AdminCommand::UserProgress { actor, user } => print_json(
            &store.progress_snapshot_as(parse_user_id(&actor)?, parse_user_id(&user)?)?,
        ),
        AdminCommand::Override(args) => {
            let change = ScoreOverride {
                score: args.score,
                bonus_points: args.bonus_points,
                instructor_notes: args.notes,
            };
            print_json(&store.override_progress(
                parse_user_id(&args.actor)?,
                parse_user_id(&args.user)?,
                &parse_lab_ref(&args.lab)?,
                &change,
            )?)
        }
    }
}

/// Maps a failure onto the stable error envelope.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> ErrorEnvelope {
    let payload = match err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProgressError>())
    {
        Some(progress) => ErrorPayload {
            code: progress.code().to_string(),
            message: progress.to_string(),
        },
        None => ErrorPayload {
            code: CLI_ERROR_CODE.to_string(),
            message: format!("{err:#}"),
        },
    };
    ErrorEnvelope { error: payload }
}

/// Renders [`error_envelope`] as pretty JSON for stderr.
#[must_use]
pub fn render_error(err: &anyhow::Error) -> String {
    let envelope = error_envelope(err);
    match serde_json::to_string_pretty(&envelope) {
        Ok(body) => body,
        Err(_) => format!(
            "{{\"error\":{{\"code\":\"{}\",\"message\":\"unrenderable error\"}}}}",
            envelope.error.code
        ),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{body}");
    Ok(())
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    Ok(raw.parse::<UserId>()?)
}

fn parse_lab_ref(raw: &str) -> Result<LabRef> {
    Ok(LabRef::parse(raw)?)
}

fn map_role(value: RoleArg) -> UserRole {
    match value {
        RoleArg::Student => UserRole::Student,
        RoleArg::Instructor => UserRole::Instructor,
        RoleArg::Ta => UserRole::Ta,
        RoleArg::Admin => UserRole::Admin,
    }
}
