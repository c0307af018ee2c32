//! `achv`: operator command surface for the achievement ledger.
//!
//! Every lifecycle command runs through [`LifecycleEngine`] with a fresh
//! [`RequestScope`] bounded by `--store-timeout-ms`, exactly as an HTTP
//! request would. Directory commands write the identity tables directly.
//! Results are printed to stdout as pretty JSON; logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use achievement_ledger_core::{
    AchievementDetails, AchievementPatch, AchievementStatus, AchievementType, Actor,
    ConsistencyReport, DocumentId, IssueSeverity, LecturerId, NewAchievement, PageRequest,
    RequestScope, RoleKind, StudentId, UserId,
};
use achievement_ledger_engine::LifecycleEngine;
use achievement_ledger_store_sqlite::{
    FsAttachmentStore, LedgerStores, NewUser, SqliteDirectory, StoreConfig,
    DEFAULT_STORE_TIMEOUT_MS, MAX_STORE_TIMEOUT_MS,
};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "achv")]
#[command(about = "Student achievement ledger CLI")]
pub struct Cli {
    #[arg(
        long,
        env = "ACHIEVEMENT_DOCUMENT_DB",
        default_value = "./achievement_documents.sqlite3"
    )]
    document_db: PathBuf,

    #[arg(
        long,
        env = "ACHIEVEMENT_REFERENCE_DB",
        default_value = "./achievement_references.sqlite3"
    )]
    reference_db: PathBuf,

    #[arg(long, env = "ACHIEVEMENT_UPLOAD_DIR", default_value = "./uploads")]
    upload_dir: PathBuf,

    #[arg(
        long,
        env = "ACHIEVEMENT_STORE_TIMEOUT_MS",
        default_value_t = DEFAULT_STORE_TIMEOUT_MS,
        value_parser = clap::value_parser!(u64).range(1..=MAX_STORE_TIMEOUT_MS)
    )]
    store_timeout_ms: u64,

    /// Credential of the acting user for achievement, report and consistency commands.
    #[arg(long = "as", env = "ACHIEVEMENT_CREDENTIAL")]
    credential: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Directory {
        #[command(subcommand)]
        command: Box<DirectoryCommand>,
    },
    Achievement {
        #[command(subcommand)]
        command: Box<AchievementCommand>,
    },
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
    Consistency {
        #[command(subcommand)]
        command: Box<ConsistencyCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum DirectoryCommand {
    AddUser(AddUserArgs),
    AddLecturer(AddLecturerArgs),
    AddStudent(AddStudentArgs),
    AssignAdvisor(AssignAdvisorArgs),
}

#[derive(Debug, Args)]
pub struct AddUserArgs {
    #[arg(long)]
    credential: String,
    #[arg(long)]
    full_name: String,
    #[arg(long)]
    role: RoleArg,
}

#[derive(Debug, Args)]
pub struct AddLecturerArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    number: String,
    #[arg(long)]
    department: String,
}

#[derive(Debug, Args)]
pub struct AddStudentArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    number: String,
    #[arg(long)]
    program: String,
    #[arg(long)]
    year: String,
    #[arg(long)]
    advisor_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct AssignAdvisorArgs {
    #[arg(long)]
    student_id: String,
    #[arg(long)]
    advisor_id: String,
}

#[derive(Debug, Subcommand)]
pub enum AchievementCommand {
    Create(CreateArgs),
    Update(UpdateArgs),
    Delete(IdArgs),
    Submit(IdArgs),
    Verify(IdArgs),
    Reject(RejectArgs),
    Attach(AttachArgs),
    List(ListArgs),
    Show(IdArgs),
    History(IdArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long = "type")]
    achievement_type: TypeArg,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    #[arg(long, default_value = "{}")]
    details_json: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    points: Option<f64>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long = "type")]
    achievement_type: Option<TypeArg>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Merged key by key into the stored details.
    #[arg(long)]
    details_json: Option<String>,
    /// Replaces the whole tag list when given at least once.
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    points: Option<f64>,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct RejectArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    note: String,
}

#[derive(Debug, Args)]
pub struct AttachArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, default_value_t = 1)]
    page: i64,
    #[arg(long, default_value_t = 10)]
    page_size: i64,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Stats,
    Student(StudentReportArgs),
}

#[derive(Debug, Args)]
pub struct StudentReportArgs {
    #[arg(long)]
    student_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ConsistencyCommand {
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Student,
    Advisor,
    Admin,
}

impl From<RoleArg> for RoleKind {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Student => Self::Student,
            RoleArg::Advisor => Self::Advisor,
            RoleArg::Admin => Self::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TypeArg {
    Academic,
    Competition,
    Organization,
    Publication,
    Certification,
    Other,
}

impl From<TypeArg> for AchievementType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Academic => Self::Academic,
            TypeArg::Competition => Self::Competition,
            TypeArg::Organization => Self::Organization,
            TypeArg::Publication => Self::Publication,
            TypeArg::Certification => Self::Certification,
            TypeArg::Other => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Draft,
    Submitted,
    Verified,
    Rejected,
}

impl From<StatusArg> for AchievementStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Draft => Self::Draft,
            StatusArg::Submitted => Self::Submitted,
            StatusArg::Verified => Self::Verified,
            StatusArg::Rejected => Self::Rejected,
        }
    }
}

/// Opened stores wired into an engine, plus the handles the engine does not own.
struct Runtime {
    engine: LifecycleEngine,
    directory: SqliteDirectory,
    attachments: FsAttachmentStore,
    store_timeout: Duration,
}

impl Runtime {
    fn open(config: &StoreConfig) -> Result<Self> {
        let stores = LedgerStores::open(config)?;
        let engine = LifecycleEngine::new(
            Arc::new(stores.documents),
            Arc::new(stores.relational.references()),
            Arc::new(stores.relational.audit_log()),
            Arc::new(stores.relational.directory()),
        );
        Ok(Self {
            engine,
            directory: stores.relational.directory(),
            attachments: stores.attachments,
            store_timeout: config.store_timeout,
        })
    }

    fn scope(&self) -> RequestScope {
        RequestScope::with_timeout(self.store_timeout)
    }

    fn actor(&self, credential: Option<&str>) -> Result<Actor> {
        let credential = credential
            .ok_or_else(|| anyhow!("--as <credential> (or ACHIEVEMENT_CREDENTIAL) is required"))?;
        Ok(self.engine.resolve_actor(&self.scope(), credential)?)
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the stores cannot be opened, arguments are
/// malformed, the engine rejects the operation, or a consistency check finds
/// drift.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = StoreConfig::new(
        &cli.document_db,
        &cli.reference_db,
        &cli.upload_dir,
        Duration::from_millis(cli.store_timeout_ms),
    );
    let credential = cli.credential.as_deref();

    match cli.command {
        Command::Db { command } => run_db(*command, &config),
        Command::Directory { command } => {
            let runtime = Runtime::open(&config)?;
            run_directory(*command, &runtime.directory)
        }
        Command::Achievement { command } => {
            let runtime = Runtime::open(&config)?;
            let actor = runtime.actor(credential)?;
            run_achievement(*command, &runtime, &actor)
        }
        Command::Report { command } => {
            let runtime = Runtime::open(&config)?;
            let actor = runtime.actor(credential)?;
            run_report(*command, &runtime, &actor)
        }
        Command::Consistency { command } => {
            let runtime = Runtime::open(&config)?;
            let actor = runtime.actor(credential)?;
            match *command {
                ConsistencyCommand::Check(args) => run_consistency(&runtime, &actor, args.json),
            }
        }
    }
}

fn run_db(command: DbCommand, config: &StoreConfig) -> Result<()> {
    match command {
        DbCommand::Migrate => {
            let stores = LedgerStores::connect(config)?;
            let report = stores.migrate()?;
            tracing::info!(
                document_version = ?report.document_after.current_version,
                reference_version = ?report.reference_after.current_version,
                "schema migration finished"
            );
            print_json(&json!({
                "document_db": config.document_db.display().to_string(),
                "reference_db": config.reference_db.display().to_string(),
                "document_schema": report.document_after,
                "reference_schema": report.reference_after,
                "applied": !(report.document_before.is_current()
                    && report.reference_before.is_current()),
            }))
        }
    }
}

fn run_directory(command: DirectoryCommand, directory: &SqliteDirectory) -> Result<()> {
    match command {
        DirectoryCommand::AddUser(args) => {
            let user = directory.register_user(&NewUser {
                credential: args.credential,
                full_name: args.full_name,
                role: args.role.into(),
            })?;
            tracing::info!(user_id = %user.user_id, role = user.role.as_str(), "registered user");
            print_json(&user)
        }
        DirectoryCommand::AddLecturer(args) => {
            let user_id = parse_id(&args.user_id, UserId::parse)?;
            let lecturer_id =
                directory.register_lecturer(user_id, &args.number, &args.department)?;
            print_json(&json!({ "lecturer_id": lecturer_id, "user_id": user_id }))
        }
        DirectoryCommand::AddStudent(args) => {
            let user_id = parse_id(&args.user_id, UserId::parse)?;
            let advisor_id = args
                .advisor_id
                .as_deref()
                .map(|raw| parse_id(raw, LecturerId::parse))
                .transpose()?;
            let student_id = directory.register_student(
                user_id,
                &args.number,
                &args.program,
                &args.year,
                advisor_id,
            )?;
            print_json(&json!({ "student_id": student_id, "user_id": user_id }))
        }
        DirectoryCommand::AssignAdvisor(args) => {
            let student_id = parse_id(&args.student_id, StudentId::parse)?;
            let advisor_id = parse_id(&args.advisor_id, LecturerId::parse)?;
            directory.assign_advisor(student_id, advisor_id)?;
            print_json(&json!({ "student_id": student_id, "advisor_id": advisor_id }))
        }
    }
}

fn run_achievement(command: AchievementCommand, runtime: &Runtime, actor: &Actor) -> Result<()> {
    let engine = &runtime.engine;
    let scope = runtime.scope();

    match command {
        AchievementCommand::Create(args) => {
            let request = NewAchievement {
                achievement_type: AchievementType::from(args.achievement_type)
                    .as_str()
                    .to_string(),
                title: args.title,
                description: args.description,
                details: parse_details_json(&args.details_json)?,
                tags: args.tags,
                points: args.points,
            };
            print_json(&engine.create(&scope, actor, request)?)
        }
        AchievementCommand::Update(args) => {
            let patch = AchievementPatch {
                achievement_type: args
                    .achievement_type
                    .map(|kind| AchievementType::from(kind).as_str().to_string()),
                title: args.title,
                description: args.description,
                details: args
                    .details_json
                    .as_deref()
                    .map(parse_details_json)
                    .transpose()?,
                tags: (!args.tags.is_empty()).then_some(args.tags),
                points: args.points,
            };
            print_json(&engine.update(&scope, actor, &DocumentId::new(args.id), patch)?)
        }
        AchievementCommand::Delete(args) => {
            engine.delete(&scope, actor, &DocumentId::new(args.id.clone()))?;
            print_json(&json!({ "document_id": args.id, "deleted": true }))
        }
        AchievementCommand::Submit(args) => {
            print_json(&engine.submit(&scope, actor, &DocumentId::new(args.id))?)
        }
        AchievementCommand::Verify(args) => {
            print_json(&engine.verify(&scope, actor, &DocumentId::new(args.id))?)
        }
        AchievementCommand::Reject(args) => print_json(&engine.reject(
            &scope,
            actor,
            &DocumentId::new(args.id),
            &args.note,
        )?),
        AchievementCommand::Attach(args) => {
            let file_name = attachment_file_name(&args.file)?;
            let bytes = std::fs::read(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            print_json(&engine.upload_attachment(
                &scope,
                actor,
                &DocumentId::new(args.id),
                &file_name,
                &bytes,
                &runtime.attachments,
            )?)
        }
        AchievementCommand::List(args) => {
            let page = engine.list(
                &scope,
                actor,
                PageRequest::new(args.page, args.page_size),
                args.status.map(AchievementStatus::from),
            )?;
            if args.json {
                return print_json(&page);
            }
            println!(
                "page={} page_size={} total={} total_pages={}",
                page.page, page.page_size, page.total, page.total_pages
            );
            for item in &page.items {
                println!(
                    "{} {} {} {}",
                    item.document.document_id,
                    item.document.fields.status,
                    item.document.fields.achievement_type.as_str(),
                    item.document.fields.title
                );
            }
            Ok(())
        }
        AchievementCommand::Show(args) => {
            print_json(&engine.get(&scope, actor, &DocumentId::new(args.id))?)
        }
        AchievementCommand::History(args) => {
            print_json(&engine.history(&scope, actor, &DocumentId::new(args.id))?)
        }
    }
}

fn run_report(command: ReportCommand, runtime: &Runtime, actor: &Actor) -> Result<()> {
    let scope = runtime.scope();
    match command {
        ReportCommand::Stats => print_json(&runtime.engine.statistics(&scope, actor)?),
        ReportCommand::Student(args) => {
            let student_id = parse_id(&args.student_id, StudentId::parse)?;
            print_json(&runtime.engine.student_statistics(&scope, actor, student_id)?)
        }
    }
}

fn run_consistency(runtime: &Runtime, actor: &Actor, json: bool) -> Result<()> {
    let report = runtime.engine.consistency_check(&runtime.scope(), actor)?;
    if json {
        print_json(&report)?;
    } else {
        print_consistency_report(&report);
    }

    if !report.healthy {
        return Err(anyhow!(
            "consistency check failed: {}",
            report
                .issues
                .iter()
                .map(|issue| format!("{}:{}", issue.code, issue.message))
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }
    Ok(())
}

fn print_consistency_report(report: &ConsistencyReport) {
    println!("healthy={}", report.healthy);
    println!(
        "checked_owners={} checked_references={} checked_documents={}",
        report.checked_owners, report.checked_references, report.checked_documents
    );
    for issue in &report.issues {
        println!(
            "{} {} document={} {}",
            issue.code,
            match issue.severity {
                IssueSeverity::Error => "error",
                IssueSeverity::Warning => "warning",
            },
            issue.document_id,
            issue.message
        );
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_id<T, E: std::fmt::Display>(raw: &str, parse: fn(&str) -> Result<T, E>) -> Result<T> {
    parse(raw).map_err(|err| anyhow!(err.to_string()))
}

fn parse_details_json(raw: &str) -> Result<AchievementDetails> {
    serde_json::from_str(raw).context("details must be a JSON object of known or custom fields")
}

fn attachment_file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("attachment path has no file name: {}", path.display()))
}
