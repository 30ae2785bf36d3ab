//! Eavstore CLI - Command-line interface for the attribute-value object store

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use eavstore::config::{self, EavConfig};
use eavstore::document::{self, Document};
use eavstore::ident::SequenceIds;
use eavstore::permission::{AllowAll, CachedPermissions};
use eavstore::reader::Assembler;
use eavstore::storage::{SqliteStore, StructureCache, StructureCatalog};
use eavstore::structure::{SchemaRegistry, StructureNode, StructureProvider};
use eavstore::ui::{self, Icons};
use eavstore::{ObjectRef, PersistConfig, Persister, PersistStrategy};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "eavstore")]
#[command(version = "0.0.1")]
#[command(about = "Generic attribute-value object store - typed object graphs in a fixed relational schema")]
#[command(long_about = r#"
Eavstore persists nested, typed object graphs into four tables
(schemes, structures, objects, object_values) instead of one table per type.

Example usage:
  eavstore init --database data/store.db
  eavstore types --file types.json
  eavstore save --input people.json --user 1
  eavstore import --input bulk.json
  eavstore show --id 12
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the database file (overrides the config)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the database schema
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Synchronize structures from a type descriptor file
    Types {
        /// JSON file with an array of type descriptors (defaults to the config's `types`)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Save JSON documents, diffing or replacing stored values
    Save {
        /// JSON file with one document or an array of documents
        #[arg(short, long)]
        input: PathBuf,

        /// Acting user id
        #[arg(short, long)]
        user: Option<i64>,

        /// Persistence strategy (change-tracking, delete-insert)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Insert many new documents through the bulk path
    Import {
        /// JSON file with an array of documents
        #[arg(short, long)]
        input: PathBuf,

        /// Acting user id
        #[arg(short, long)]
        user: Option<i64>,
    },

    /// Show an object row, its value records and its reassembled document
    Show {
        /// Object id
        #[arg(long)]
        id: i64,
    },

    /// Show table statistics
    Stats,
}

/// Settings resolved from the config file and the command line
struct Settings {
    config_path: PathBuf,
    database: PathBuf,
    types: Option<PathBuf>,
    persist: PersistConfig,
}

impl Settings {
    fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
        let file = config::load_config(Some(config_path.as_path()))?.unwrap_or_default();
        let base = config_path.parent().unwrap_or_else(|| Path::new(""));

        let database = cli
            .database
            .clone()
            .or_else(|| file.database.as_ref().map(|d| base.join(d)))
            .unwrap_or_else(|| config::default_database_path_in(base));
        let types = file.types.as_ref().map(|t| base.join(t));
        let persist = file.persist_config()?;

        Ok(Self {
            config_path,
            database,
            types,
            persist,
        })
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        config::ensure_db_dir(&self.database)?;
        Ok(SqliteStore::open(&self.database)?)
    }

    /// Registry from the configured types file; empty when there is none
    fn registry(&self) -> anyhow::Result<SchemaRegistry> {
        match &self.types {
            Some(path) if path.exists() => Ok(SchemaRegistry::load_json(path)?),
            Some(path) => {
                tracing::debug!("types file {} not found, structures must already exist", path.display());
                Ok(SchemaRegistry::new())
            }
            None => Ok(SchemaRegistry::new()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let settings = Settings::resolve(&cli)?;

    match cli.command {
        Commands::Init { force } => {
            let database = settings.database.to_string_lossy().to_string();
            config::write_config(&settings.config_path, &EavConfig::starter(&database), force)?;
            let store = settings.open_store()?;
            let stats = store.stats()?;

            ui::success("Initialized eavstore");
            ui::status(Icons::GEAR, "Config", &settings.config_path.display().to_string());
            ui::status(Icons::DATABASE, "Database", &database);
            ui::summary_row("Schemes", &stats.schemes.to_string());
        }

        Commands::Types { file } => {
            let path = file
                .or_else(|| settings.types.clone())
                .ok_or_else(|| anyhow::anyhow!("no types file given and none configured"))?;
            let registry = SchemaRegistry::load_json(&path)?;
            let store = settings.open_store()?;
            let cache = StructureCache::new();
            let catalog = StructureCatalog::new(&store, &cache, &registry);

            ui::header(&format!("Synchronizing {} types", registry.len()));
            ui::status(Icons::FILE, "Types", &path.display().to_string());
            let mut descriptors: Vec<_> = registry.iter().collect();
            descriptors.sort_by(|a, b| a.name.cmp(&b.name));
            for descriptor in descriptors {
                let scheme = catalog.ensure_scheme(&descriptor.name)?;
                catalog.sync_structures(&scheme)?;
                ui::section(&format!(" {} {} (scheme {}) ", Icons::TREE, scheme.name, scheme.id));
                println!("{}", ui::structure_table(&structure_rows(&catalog, scheme.id)?));
            }
        }

        Commands::Save { input, user, strategy, format } => {
            let mut persist = settings.persist.clone();
            if let Some(s) = strategy {
                persist.strategy = s.parse::<PersistStrategy>()?;
            }
            let objects = load_objects(&input)?;
            let registry = settings.registry()?;
            let store = settings.open_store()?;
            let cache = StructureCache::new();
            let catalog = StructureCatalog::new(&store, &cache, &registry);
            let ids = SequenceIds::starting_after(store.max_assigned_id()?);
            let permissions = CachedPermissions::new(AllowAll, persist.permission_ttl);
            let persister = Persister::new(&store, &catalog, &ids)
                .with_permissions(&permissions)
                .with_config(persist);

            let started = Instant::now();
            let report = persister.save(&objects, user)?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                ui::header(&format!("Saved {} documents ({})", objects.len(), persister.config().strategy));
                for id in &report.inserted {
                    ui::object_inserted(&scheme_name(&store, *id)?, *id);
                }
                for id in &report.updated {
                    ui::object_updated(&scheme_name(&store, *id)?, *id);
                }
                for id in &report.unchanged {
                    ui::object_unchanged(&scheme_name(&store, *id)?, *id);
                }
                for id in &report.skipped {
                    ui::object_skipped(*id, "no stored row");
                }
                for failure in &report.schema_failures {
                    ui::object_skipped(failure.object_id, &format!("{}: {}", failure.scheme, failure.reason));
                }
                if !report.schema_failures.is_empty() {
                    ui::warn(&format!(
                        "{} objects left out, run `eavstore types` to register their types",
                        report.schema_failures.len()
                    ));
                }
                ui::section(" Values ");
                ui::summary_row("Inserted", &report.values.inserted.to_string());
                ui::summary_row("Updated", &report.values.updated.to_string());
                ui::summary_row("Deleted", &report.values.deleted.to_string());
                ui::summary_row("Purged objects", &report.values.purged_objects.to_string());
                ui::timing(&format!("{:.2?}", started.elapsed()));
            }
        }

        Commands::Import { input, user } => {
            let objects = load_objects(&input)?;
            let registry = settings.registry()?;
            let store = settings.open_store()?;
            let cache = StructureCache::new();
            let catalog = StructureCatalog::new(&store, &cache, &registry);
            let ids = SequenceIds::starting_after(store.max_assigned_id()?);
            let persister = Persister::new(&store, &catalog, &ids).with_config(settings.persist.clone());

            let started = Instant::now();
            let created = persister.batch_create(&objects, user)?;

            ui::success(&format!("Imported {} documents", created.len()));
            ui::status(Icons::PACKAGE, "Ids", &format_ids(&created));
            ui::timing(&format!("{:.2?}", started.elapsed()));
        }

        Commands::Show { id } => {
            let store = settings.open_store()?;
            let Some(record) = store.get_object(id)? else {
                ui::error(&format!("Object {} not found", id));
                return Ok(());
            };
            let registry = SchemaRegistry::new();
            let cache = StructureCache::new();
            let catalog = StructureCatalog::new(&store, &cache, &registry);
            let scheme = scheme_name(&store, id)?;

            ui::header(&format!("{} #{}", scheme, id));
            ui::info("Parent", &record.parent_id.map(|p| p.to_string()).unwrap_or_else(|| "-".into()));
            ui::info("Owner", &record.owner_id.map(|o| o.to_string()).unwrap_or_else(|| "-".into()));
            ui::info("Modified", &record.modified_at.to_rfc3339());
            ui::info("Hash", &ui::muted(record.hash.as_deref().unwrap_or("-")));

            let values = store.load_values(&[id])?;
            ui::section(&format!(" {} Values ", Icons::LINK));
            println!(
                "{}",
                ui::value_table(&values, |structure_id| {
                    catalog
                        .node(record.scheme_id, structure_id)
                        .ok()
                        .flatten()
                        .map(|n| n.name)
                        .unwrap_or_else(|| structure_id.to_string())
                })
            );

            let fields = Assembler::new(&catalog).assemble(record.scheme_id, &values)?;
            let document = Document {
                scheme,
                id,
                parent_id: record.parent_id,
                code: record.code_string.clone(),
                note: record.note.clone(),
                properties: Some(document::fields_to_json(&fields)),
            };
            ui::section(" Document ");
            println!("{}", serde_json::to_string_pretty(&document)?);
        }

        Commands::Stats => {
            let store = settings.open_store()?;
            let stats = store.stats()?;

            println!("{} Eavstore Statistics ({})", Icons::STATS, ui::dim(&settings.database.display().to_string()));
            println!(
                "{}",
                ui::stats_table(&[
                    ("Schemes", &stats.schemes.to_string()),
                    ("Structures", &stats.structures.to_string()),
                    ("Objects", &stats.objects.to_string()),
                    ("Values", &stats.values.to_string()),
                ])
            );
        }
    }

    Ok(())
}

fn load_objects(path: &Path) -> anyhow::Result<Vec<ObjectRef>> {
    let documents = document::load_documents(path)?;
    tracing::debug!("loaded {} documents from {}", documents.len(), path.display());
    Ok(documents
        .into_iter()
        .map(Document::into_object)
        .collect::<eavstore::Result<Vec<_>>>()?)
}

fn scheme_name(store: &SqliteStore, object_id: i64) -> anyhow::Result<String> {
    let record = store
        .get_object(object_id)?
        .ok_or_else(|| anyhow::anyhow!("object {} not found", object_id))?;
    Ok(store
        .get_scheme(record.scheme_id)?
        .map(|s| s.name)
        .unwrap_or_else(|| format!("scheme {}", record.scheme_id)))
}

/// Structure forest of a scheme, depth-first with nesting depth
fn structure_rows(catalog: &StructureCatalog<'_>, scheme_id: i64) -> anyhow::Result<Vec<(usize, StructureNode)>> {
    fn walk(
        catalog: &StructureCatalog<'_>,
        scheme_id: i64,
        parent: Option<i64>,
        depth: usize,
        out: &mut Vec<(usize, StructureNode)>,
    ) -> eavstore::Result<()> {
        for node in catalog.children(scheme_id, parent)? {
            let id = node.id;
            let nested = node.has_children();
            out.push((depth, node));
            if nested {
                walk(catalog, scheme_id, Some(id), depth + 1, out)?;
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(catalog, scheme_id, None, 0, &mut out)?;
    Ok(out)
}

fn format_ids(ids: &[i64]) -> String {
    const SHOWN: usize = 10;
    let mut text = ids.iter().take(SHOWN).map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
    if ids.len() > SHOWN {
        text.push_str(&format!(" … (+{})", ids.len() - SHOWN));
    }
    text
}
