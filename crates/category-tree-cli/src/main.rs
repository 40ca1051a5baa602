use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use category_tree_api::{
    AddSatelliteRequest, CategoryTreeApi, RemoveSatelliteRequest, API_CONTRACT_VERSION,
};
use category_tree_core::{
    ContentId, CreateNode, EngineConfig, HierarchyKey, MoveNode, PlacementId, RemoveNode,
    RemoveTarget, SatelliteKind, UpdateConfig,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ctree")]
#[command(about = "Category tree configuration inheritance CLI")]
struct Cli {
    #[arg(long, default_value = "./category_tree.sqlite3")]
    db: PathBuf,

    /// YAML engine configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `max_depth` from the configuration file.
    #[arg(long)]
    max_depth: Option<usize>,

    /// Tracing filter directive; falls back to `RUST_LOG`, then `warn`.
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, default_value = "ctree")]
    operator: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Tree {
        #[command(subcommand)]
        command: Box<TreeCommand>,
    },
    Content {
        #[command(subcommand)]
        command: Box<ContentCommand>,
    },
    Satellite {
        #[command(subcommand)]
        command: Box<SatelliteCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args)]
struct ScopeArgs {
    #[arg(long)]
    owner: String,
    #[arg(long, default_value = "main")]
    branch: String,
}

impl ScopeArgs {
    fn key(&self) -> HierarchyKey {
        HierarchyKey::new(self.owner.clone(), self.branch.clone())
    }
}

#[derive(Debug, Subcommand)]
enum TreeCommand {
    Init(InitArgs),
    Show(ScopeArgs),
    List,
    Create(CreateArgs),
    Move(MoveArgs),
    Remove(RemoveArgs),
    Refresh(RefreshArgs),
    Verify(ScopeArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    root: String,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    /// Parent placement id.
    #[arg(long)]
    parent: String,
    #[arg(long = "content")]
    content_id: String,
    #[arg(long, default_value_t = false)]
    category: bool,
    #[arg(long)]
    local_config: Option<String>,
    #[arg(long)]
    category_config: Option<String>,
}

#[derive(Debug, Args)]
struct MoveArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    placement: String,
    #[arg(long)]
    new_parent: String,
}

#[derive(Debug, Args)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["placement", "content_id"])))]
struct RemoveArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    placement: Option<String>,
    #[arg(long = "content")]
    content_id: Option<String>,
    #[arg(long, default_value_t = false)]
    purge: bool,
}

#[derive(Debug, Args)]
struct RefreshArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long = "content", required = true)]
    content_ids: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ContentCommand {
    Chain(ContentArgs),
    Inherited(ContentArgs),
    Show(ContentArgs),
    UpdateConfig(UpdateConfigArgs),
}

#[derive(Debug, Args)]
struct ContentArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long = "content")]
    content_id: String,
}

#[derive(Debug, Args)]
struct UpdateConfigArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long = "content")]
    content_id: String,
    #[arg(long)]
    local_config: String,
    #[arg(long)]
    category_config: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Localization,
    FunctionLink,
}

impl From<KindArg> for SatelliteKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Localization => Self::Localization,
            KindArg::FunctionLink => Self::FunctionLink,
        }
    }
}

#[derive(Debug, Subcommand)]
enum SatelliteCommand {
    Add(SatelliteAddArgs),
    Remove(SatelliteRefArgs),
    List(SatelliteListArgs),
}

#[derive(Debug, Args)]
struct SatelliteAddArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long = "content")]
    content_id: String,
    #[arg(long)]
    record_key: String,
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
struct SatelliteRefArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long = "content")]
    content_id: String,
    #[arg(long)]
    record_key: String,
}

#[derive(Debug, Args)]
struct SatelliteListArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long = "content")]
    content_id: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid --log-level directive `{directive}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// File values first, then flag overrides, then validation.
fn load_engine_config(path: Option<&Path>, max_depth: Option<usize>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_yaml::from_str::<EngineConfig>(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(max_depth) = max_depth {
        config.max_depth = max_depth;
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{flag} MUST be valid JSON"))
}

fn parse_placement(flag: &str, raw: &str) -> Result<PlacementId> {
    raw.parse::<PlacementId>().with_context(|| format!("--{flag} MUST be a placement id"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;
    let config = load_engine_config(cli.config.as_deref(), cli.max_depth)?;
    tracing::debug!(
        db = %cli.db.display(),
        api_contract = API_CONTRACT_VERSION,
        max_depth = config.max_depth,
        "ctree starting"
    );
    let api = CategoryTreeApi::new(cli.db, config);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Tree { command } => run_tree(*command, &api, &cli.operator),
        Command::Content { command } => run_content(*command, &api, &cli.operator),
        Command::Satellite { command } => run_satellite(*command, &api, &cli.operator),
    }
}

fn run_db(command: DbCommand, api: &CategoryTreeApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_tree(command: TreeCommand, api: &CategoryTreeApi, operator: &str) -> Result<()> {
    match command {
        TreeCommand::Init(args) => {
            let hierarchy =
                api.init_hierarchy(&args.scope.key(), ContentId::new(args.root), operator)?;
            emit(&hierarchy)
        }
        TreeCommand::Show(scope) => emit(&api.show_hierarchy(&scope.key())?),
        TreeCommand::List => {
            let hierarchies = api.list_hierarchies()?;
            emit_json(serde_json::json!({ "hierarchies": hierarchies }))
        }
        TreeCommand::Create(args) => {
            let request = CreateNode {
                parent: parse_placement("parent", &args.parent)?,
                content_id: ContentId::new(args.content_id),
                is_category: args.category,
                local_config: args
                    .local_config
                    .as_deref()
                    .map(|raw| parse_json_arg("local-config", raw))
                    .transpose()?,
                category_config: args
                    .category_config
                    .as_deref()
                    .map(|raw| parse_json_arg("category-config", raw))
                    .transpose()?,
            };
            emit(&api.create_node(&args.scope.key(), operator, request)?)
        }
        TreeCommand::Move(args) => {
            let request = MoveNode {
                placement_id: parse_placement("placement", &args.placement)?,
                new_parent: parse_placement("new-parent", &args.new_parent)?,
            };
            emit(&api.move_node(&args.scope.key(), operator, request)?)
        }
        TreeCommand::Remove(args) => {
            let target = match (args.placement.as_deref(), args.content_id) {
                (Some(raw), _) => RemoveTarget::Placement(parse_placement("placement", raw)?),
                (None, Some(content_id)) => RemoveTarget::Content(ContentId::new(content_id)),
                (None, None) => return Err(anyhow!("--placement or --content MUST be provided")),
            };
            let request = RemoveNode { target, purge: args.purge };
            emit(&api.remove_node(&args.scope.key(), operator, request)?)
        }
        TreeCommand::Refresh(args) => {
            let content_ids: Vec<ContentId> =
                args.content_ids.into_iter().map(ContentId::new).collect();
            emit(&api.refresh(&args.scope.key(), operator, &content_ids)?)
        }
        TreeCommand::Verify(scope) => emit(&api.verify(&scope.key())?),
    }
}

fn run_content(command: ContentCommand, api: &CategoryTreeApi, operator: &str) -> Result<()> {
    match command {
        ContentCommand::Chain(args) => {
            let content_id = ContentId::new(args.content_id);
            let chain = api.get_ancestor_chain(&args.scope.key(), &content_id)?;
            emit_json(serde_json::json!({
                "content_id": content_id,
                "ancestor_chain": chain
            }))
        }
        ContentCommand::Inherited(args) => {
            let content_id = ContentId::new(args.content_id);
            let snapshot = api.get_inherited_config(&args.scope.key(), &content_id)?;
            emit_json(serde_json::json!({
                "content_id": content_id,
                "inherited_config": snapshot
            }))
        }
        ContentCommand::Show(args) => {
            emit(&api.get_content(&args.scope.key(), &ContentId::new(args.content_id))?)
        }
        ContentCommand::UpdateConfig(args) => {
            let request = UpdateConfig {
                content_id: ContentId::new(args.content_id),
                local_config: parse_json_arg("local-config", &args.local_config)?,
                category_config: args
                    .category_config
                    .as_deref()
                    .map(|raw| parse_json_arg("category-config", raw))
                    .transpose()?,
            };
            emit(&api.update_config(&args.scope.key(), operator, request)?)
        }
    }
}

fn run_satellite(command: SatelliteCommand, api: &CategoryTreeApi, operator: &str) -> Result<()> {
    match command {
        SatelliteCommand::Add(args) => {
            let request = AddSatelliteRequest {
                key: args.scope.key(),
                kind: args.kind.into(),
                owner_content_id: ContentId::new(args.content_id),
                record_key: args.record_key,
                payload: parse_json_arg("payload", &args.payload)?,
            };
            emit(&api.add_satellite(operator, request)?)
        }
        SatelliteCommand::Remove(args) => {
            let request = RemoveSatelliteRequest {
                key: args.scope.key(),
                kind: args.kind.into(),
                owner_content_id: ContentId::new(args.content_id),
                record_key: args.record_key,
            };
            emit(&api.remove_satellite(operator, &request)?)
        }
        SatelliteCommand::List(args) => {
            let listing = api.list_satellites(
                &args.scope.key(),
                args.kind.into(),
                &ContentId::new(args.content_id),
            )?;
            emit(&listing)
        }
    }
}
