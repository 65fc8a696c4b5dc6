use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use docindex::projection::builtin::{CHARON_DOCTYPE_FIELD, charon_views};
use docindex::storage::ViewCheckpoint;
use docindex::{
    EngineConfig, Freshness, Grouping, IndexEngine, KeyBound, KeyRange, MemoryDocumentStore,
    Order, RangeQuery, ReduceQuery, Value,
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docindex-tool")]
#[command(about = "Developer tooling for docindex views")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load an NDJSON document file and query one of the built-in views
    Query {
        #[arg(long)]
        docs: PathBuf,
        #[arg(long)]
        view: String,
        /// Exact key, as JSON
        #[arg(long)]
        key: Option<String>,
        /// Array key prefix, as a JSON array
        #[arg(long)]
        prefix: Option<String>,
        /// First key in iteration order, as JSON
        #[arg(long)]
        start: Option<String>,
        /// Last key in iteration order, as JSON
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        descending: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
        /// Run the view's reduce instead of listing rows
        #[arg(long)]
        reduce: bool,
        /// Group reduce rows by the first N key elements
        #[arg(long)]
        group_level: Option<usize>,
        /// Count distinct groups at `--group-level` instead of reducing
        #[arg(long)]
        distinct: bool,
        /// Attach each row's document to range results
        #[arg(long)]
        include_docs: bool,
        /// Document field holding the doctype [default: charon_doctype]
        #[arg(long)]
        doctype_field: Option<String>,
        /// Engine configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List the built-in views
    Views,
    /// Print the header of a checkpoint file
    Inspect {
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Query {
            docs,
            view,
            key,
            prefix,
            start,
            end,
            descending,
            limit,
            cursor,
            reduce,
            group_level,
            distinct,
            include_docs,
            doctype_field,
            config,
        } => {
            let bounds = Bounds::parse(key, prefix, start, end)?;
            let engine = load_engine(&docs, doctype_field.as_deref(), config.as_deref()).await?;
            let output = if distinct {
                let level = group_level.ok_or_else(|| anyhow!("--distinct needs --group-level"))?;
                let range = bounds.range(descending);
                let groups = engine
                    .distinct_groups(&view, &range, Grouping::Level(level), Freshness::AllowStale)
                    .await?;
                json!({ "view": view, "group_level": level, "groups": groups })
            } else if reduce {
                run_reduce(&engine, &view, &bounds, descending, limit, group_level).await?
            } else {
                let page = Page {
                    descending,
                    limit,
                    cursor,
                    include_docs,
                };
                run_range(&engine, &view, &bounds, page).await?
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Views => {
            for definition in charon_views() {
                println!("{}\t{}", definition.id(), definition.reduce().fingerprint());
            }
            Ok(())
        }
        Command::Inspect { checkpoint } => inspect(&checkpoint),
    }
}

/// Key bounds from the command line, in iteration order.
struct Bounds {
    start: KeyBound,
    end: KeyBound,
}

impl Bounds {
    fn parse(
        key: Option<String>,
        prefix: Option<String>,
        start: Option<String>,
        end: Option<String>,
    ) -> Result<Self> {
        if let Some(key) = key {
            let key = parse_value("--key", &key)?;
            return Ok(Self {
                start: KeyBound::Included(key.clone()),
                end: KeyBound::Included(key),
            });
        }
        if let Some(prefix) = prefix {
            let Value::Array(parts) = parse_value("--prefix", &prefix)? else {
                bail!("--prefix must be a JSON array");
            };
            return Ok(Self {
                start: KeyBound::Prefix(parts.clone()),
                end: KeyBound::Prefix(parts),
            });
        }
        let bound = |flag: &str, raw: Option<String>| -> Result<KeyBound> {
            Ok(match raw {
                Some(raw) => KeyBound::Included(parse_value(flag, &raw)?),
                None => KeyBound::Unbounded,
            })
        };
        Ok(Self {
            start: bound("--start", start)?,
            end: bound("--end", end)?,
        })
    }

    fn order(descending: bool) -> Order {
        if descending {
            Order::Descending
        } else {
            Order::Ascending
        }
    }

    fn range(&self, descending: bool) -> KeyRange {
        KeyRange::from_iteration_order(self.start.clone(), self.end.clone(), Self::order(descending))
    }
}

fn parse_value(flag: &str, raw: &str) -> Result<Value> {
    let json: serde_json::Value = serde_json::from_str(raw)
        .with_context(|| format!("{} is not valid JSON: {}", flag, raw))?;
    Ok(Value::from(json))
}

/// A config file's `doctype_field` wins over the Charon default; the flag
/// wins over both.
async fn load_engine(
    docs: &Path,
    doctype_field: Option<&str>,
    config: Option<&Path>,
) -> Result<IndexEngine> {
    let config = match config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::new().doctype_field(CHARON_DOCTYPE_FIELD),
    }
    .doctype_field_override(doctype_field);

    let store = Arc::new(MemoryDocumentStore::from_config(&config));
    let raw = fs::read_to_string(docs)
        .with_context(|| format!("Failed to read documents from '{}'", docs.display()))?;
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let json: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", docs.display(), line_no + 1))?;
        store
            .put_json(json)
            .await
            .with_context(|| format!("{}:{}: invalid document", docs.display(), line_no + 1))?;
    }

    let engine = IndexEngine::new(store, config);
    for definition in charon_views() {
        engine.register_view(definition).await?;
    }
    Ok(engine)
}

/// Paging options of a range listing.
struct Page {
    descending: bool,
    limit: Option<usize>,
    cursor: Option<String>,
    include_docs: bool,
}

async fn run_range(
    engine: &IndexEngine,
    view: &str,
    bounds: &Bounds,
    page: Page,
) -> Result<serde_json::Value> {
    let mut query = RangeQuery {
        start: bounds.start.clone(),
        end: bounds.end.clone(),
        order: Bounds::order(page.descending),
        ..RangeQuery::default()
    };
    if let Some(limit) = page.limit {
        query = query.with_limit(limit);
    }
    if let Some(cursor) = page.cursor {
        query = query.with_cursor(cursor);
    }
    if page.include_docs {
        query = query.include_docs();
    }

    let page = engine.range_query(view, &query).await?;
    let rows: Vec<serde_json::Value> = page
        .rows
        .iter()
        .map(|row| {
            let mut out = json!({ "id": row.doc_id.as_str(), "key": row.key.to_json(), "value": row.value.to_json() });
            if query.include_docs {
                out["doc"] = row
                    .doc
                    .as_ref()
                    .map(|doc| doc.to_value().to_json())
                    .unwrap_or(serde_json::Value::Null);
            }
            out
        })
        .collect();
    Ok(json!({
        "view": view,
        "total_rows": page.total_rows,
        "watermark": page.watermark.0,
        "rows": rows,
        "next_cursor": page.next_cursor,
    }))
}

async fn run_reduce(
    engine: &IndexEngine,
    view: &str,
    bounds: &Bounds,
    descending: bool,
    limit: Option<usize>,
    group_level: Option<usize>,
) -> Result<serde_json::Value> {
    let range = bounds.range(descending);
    let mut query = ReduceQuery::with_bounds(range.lower, range.upper);
    if let Some(level) = group_level {
        query = query.group_level(level);
    }
    if descending {
        query = query.descending();
    }
    if let Some(limit) = limit {
        query = query.with_limit(limit);
    }

    let rows = engine.reduce_query(view, &query).await?;
    let rows: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| json!({ "key": row.key.to_json(), "value": row.value.to_json() }))
        .collect();
    Ok(json!({ "view": view, "rows": rows }))
}

fn inspect(path: &Path) -> Result<()> {
    let checkpoint = ViewCheckpoint::read_file(path)
        .with_context(|| format!("Failed to load checkpoint '{}'", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&checkpoint.header())?);
    Ok(())
}
