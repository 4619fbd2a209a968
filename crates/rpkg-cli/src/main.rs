mod commands;

use clap::{Args, Parser, Subcommand};
use commands::clone::CloneSource;
use commands::eval::EvalArgs;
use commands::lifecycle::Transition;
use commands::update::UpdateSource;
use commands::CliError;
use rpkg_core::{install_signal_handler, Engine, EngineConfig, RevisionFilter};
use rpkg_remote::{Credentials, GitCliFetcher};
use rpkg_schema::{MergeStrategy, PackageInitTaskSpec, RevisionKey, Selector};
use rpkg_store::StoreLayout;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "rpkg",
    version,
    about = "Versioned configuration package revisions with a replayable task pipeline"
)]
struct Cli {
    /// Path to the rpkg store directory.
    #[arg(long, default_value = "~/.local/share/rpkg", global = true)]
    store: String,

    /// Engine configuration file (defaults to <store>/rpkg.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Function runner: builtin or mock.
    #[arg(long, default_value = "builtin", global = true)]
    runner: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Target {
    /// Repository the new revision belongs to.
    #[arg(long)]
    repository: String,
    /// Revision (workspace) name of the new revision.
    #[arg(long, default_value = "v1")]
    revision: String,
}

impl Target {
    fn key(&self, package: &str) -> RevisionKey {
        RevisionKey::new(self.repository.clone(), package, self.revision.clone())
    }
}

#[derive(Debug, Args)]
struct Version {
    /// Last observed resource version; defaults to the current one.
    #[arg(long = "resource-version")]
    resource_version: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new package revision scaffolded with a Kptfile.
    Init {
        /// Package name; may be nested (a/b).
        package: String,
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "")]
        description: String,
        /// Comma-separated keywords.
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
        #[arg(long, default_value = "")]
        site: String,
    },
    /// Create a new package revision from an upstream package.
    Clone {
        /// Git URL, oci://image, or the name of an existing revision.
        source: String,
        /// Package name of the new revision.
        package: String,
        #[command(flatten)]
        target: Target,
        /// Directory inside the git repository.
        #[arg(long)]
        directory: Option<String>,
        /// Git branch, tag or commit.
        #[arg(long = "ref")]
        git_ref: Option<String>,
        /// Name of the git credential to use.
        #[arg(long)]
        secret: Option<String>,
        /// Merge strategy used by later updates.
        #[arg(long, default_value = "resource-merge")]
        strategy: MergeStrategy,
    },
    /// Create a new package revision holding a copy of an existing one.
    Copy {
        /// Name of the source revision.
        source: String,
        /// Package name of the new revision.
        package: String,
        #[command(flatten)]
        target: Target,
    },
    /// Replace a Draft's content with a local directory.
    Push {
        name: String,
        dir: PathBuf,
        #[command(flatten)]
        version: Version,
    },
    /// Print a revision's content or write it to a directory.
    Pull {
        name: String,
        /// Destination; must not exist yet or be empty.
        dir: Option<PathBuf>,
    },
    /// Propose a Draft for publication.
    Propose {
        name: String,
        #[command(flatten)]
        version: Version,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Publish a Proposed revision.
    Approve {
        name: String,
        #[command(flatten)]
        version: Version,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Send a Proposed revision back to Draft.
    Reject {
        name: String,
        #[command(flatten)]
        version: Version,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Show one revision, or list revisions matching the filters.
    Get {
        name: Option<String>,
        /// Package name substring.
        #[arg(long)]
        package: Option<String>,
        /// Revision substring.
        #[arg(long)]
        revision: Option<String>,
        /// Exact repository name.
        #[arg(long)]
        repository: Option<String>,
    },
    /// Delete a package revision.
    Del {
        name: String,
        #[command(flatten)]
        version: Version,
    },
    /// Merge new upstream content into a Draft.
    Update {
        name: String,
        /// New upstream source; defaults to the one last cloned or updated from.
        #[arg(long)]
        upstream: Option<String>,
        /// Package directory; without --upstream, replaces the tracked one.
        #[arg(long)]
        directory: Option<String>,
        /// Git ref; without --upstream, replaces the tracked one.
        #[arg(long = "ref")]
        git_ref: Option<String>,
        #[arg(long)]
        secret: Option<String>,
        /// Overrides the strategy recorded at clone time.
        #[arg(long)]
        strategy: Option<MergeStrategy>,
        #[command(flatten)]
        version: Version,
    },
    /// Run a function over a Draft's resources.
    Eval {
        name: String,
        /// Function image.
        #[arg(long, conflicts_with = "function", required_unless_present = "function")]
        image: Option<String>,
        /// Catalog function name.
        #[arg(long)]
        function: Option<String>,
        #[arg(long, default_value = "")]
        subpackage: String,
        /// Function config as key=value pairs.
        #[arg(long = "config-value")]
        config_value: Vec<String>,
        #[arg(long)]
        match_api_version: Option<String>,
        #[arg(long)]
        match_kind: Option<String>,
        #[arg(long)]
        match_name: Option<String>,
        #[arg(long)]
        match_namespace: Option<String>,
        #[arg(long, default_value_t = false)]
        include_meta_resources: bool,
        #[arg(long, default_value_t = false)]
        network: bool,
        #[command(flatten)]
        version: Version,
    },
    /// Re-derive a revision from its recorded tasks and verify its content.
    Replay { name: String },
    /// Run garbage collection on the store.
    Gc {
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Also drop cached upstream content no revision refers to.
        #[arg(long, default_value_t = false)]
        prune_cache: bool,
    },
}

fn build_engine(store: &Path, config: Option<&Path>, runner: &str) -> Result<Engine, CliError> {
    let layout = StoreLayout::new(store);
    let config = match config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(&layout.config_file())?,
    };
    let credentials =
        Credentials::load_default().map_err(|e| CliError::Failed(format!("credentials: {e}")))?;
    let git = GitCliFetcher::new(layout.store_dir().join("scratch"))
        .with_credentials(credentials)
        .with_timeout(config.timeouts.fetch());
    let runner = rpkg_runtime::select_runner(runner)
        .ok_or_else(|| CliError::Invalid(format!("unknown function runner '{runner}'")))?;
    Ok(Engine::new(store)
        .with_config(config)
        .with_git(Arc::new(git))
        .with_runner(Arc::from(runner)))
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RPKG_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let store_path = expand_tilde(&cli.store);
    let result = build_engine(&store_path, cli.config.as_deref(), &cli.runner)
        .and_then(|engine| dispatch(&engine, cli.command, cli.json));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn dispatch(engine: &Engine, command: Commands, json: bool) -> Result<u8, CliError> {
    let actor = |actor: Option<String>| actor.unwrap_or_else(commands::default_actor);
    match command {
        Commands::Init {
            package,
            target,
            description,
            keywords,
            site,
        } => commands::init::run(
            engine,
            &target.key(&package),
            PackageInitTaskSpec {
                subpackage: String::new(),
                description,
                keywords,
                site,
            },
            json,
        ),
        Commands::Clone {
            source,
            package,
            target,
            directory,
            git_ref,
            secret,
            strategy,
        } => commands::clone::run(
            engine,
            &CloneSource {
                source: &source,
                directory: directory.as_deref(),
                git_ref: git_ref.as_deref(),
                secret: secret.as_deref(),
            },
            &target.key(&package),
            strategy,
            json,
        ),
        Commands::Copy {
            source,
            package,
            target,
        } => commands::copy::run(engine, &source, &target.key(&package), json),
        Commands::Push { name, dir, version } => {
            commands::push::run(engine, &name, &dir, version.resource_version, json)
        }
        Commands::Pull { name, dir } => commands::pull::run(engine, &name, dir.as_deref(), json),
        Commands::Propose {
            name,
            version,
            actor: who,
        } => commands::lifecycle::run(
            engine,
            Transition::Propose,
            &name,
            version.resource_version,
            &actor(who),
            json,
        ),
        Commands::Approve {
            name,
            version,
            actor: who,
        } => commands::lifecycle::run(
            engine,
            Transition::Approve,
            &name,
            version.resource_version,
            &actor(who),
            json,
        ),
        Commands::Reject {
            name,
            version,
            actor: who,
        } => commands::lifecycle::run(
            engine,
            Transition::Reject,
            &name,
            version.resource_version,
            &actor(who),
            json,
        ),
        Commands::Get {
            name,
            package,
            revision,
            repository,
        } => commands::get::run(
            engine,
            name.as_deref(),
            &RevisionFilter {
                package,
                revision,
                repository,
            },
            json,
        ),
        Commands::Del { name, version } => {
            commands::del::run(engine, &name, version.resource_version, json)
        }
        Commands::Update {
            name,
            upstream,
            directory,
            git_ref,
            secret,
            strategy,
            version,
        } => {
            let source = UpdateSource {
                source: upstream.as_deref(),
                directory: directory.as_deref(),
                git_ref: git_ref.as_deref(),
                secret: secret.as_deref(),
            };
            commands::update::run(
                engine,
                &name,
                &source,
                strategy,
                version.resource_version,
                json,
            )
        }
        Commands::Eval {
            name,
            image,
            function,
            subpackage,
            config_value,
            match_api_version,
            match_kind,
            match_name,
            match_namespace,
            include_meta_resources,
            network,
            version,
        } => commands::eval::run(
            engine,
            &name,
            EvalArgs {
                image,
                function,
                subpackage,
                config: config_value,
                selector: Selector {
                    api_version: match_api_version.unwrap_or_default(),
                    kind: match_kind.unwrap_or_default(),
                    name: match_name.unwrap_or_default(),
                    namespace: match_namespace.unwrap_or_default(),
                },
                include_meta_resources,
                enable_network: network,
            },
            version.resource_version,
            json,
        ),
        Commands::Replay { name } => commands::replay::run(engine, &name, json),
        Commands::Gc {
            dry_run,
            prune_cache,
        } => commands::gc::run(engine, dry_run, prune_cache, json),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
