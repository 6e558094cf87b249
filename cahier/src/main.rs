use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use cahier::address::{Address, NodeAddress};
use cahier::core::{
    EmbeddedEntry, EntryKind, Item, Separator, Section, SubSection, SubSubSection, TopLevelEntry,
    validate,
};
use cahier::history::History;
use cahier::migrate::{ImportMode, load_str, merge};
use cahier::mutations::{self, Direction, Edit, EditError, Field, IntoEdit};
use cahier::projectors::flatten::{GroupedRow, RowKind, flatten, group_by_date};
use cahier::projectors::search::filter_document;
use cahier::storage::{DocumentStore, FileStore};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

mod config;

use config::CliConfig;

#[derive(Debug, Parser)]
#[command(
    name = "cahier",
    about = "Lesson-log editing built on the cahier crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Directory holding the logs. Overrides the config file.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print a log as date-grouped rows.
    Show(ShowArgs),

    /// Check a log against the schema.
    Validate(KeyArgs),

    /// Import a JSON log, replacing or appending to the stored one.
    Import(ImportArgs),

    /// Add a chapter or graded-work entry.
    AddEntry(AddEntryArgs),

    /// Add a section under an entry, a subsection under a section, and so on.
    AddSection(AddSectionArgs),

    /// Add an item (or an embedded graded-work entry) to a section.
    AddItem(AddItemArgs),

    /// Attach or remove the separator after a node.
    Separator(SeparatorArgs),

    /// Delete a node with its subtree, or a separator (`ADDRESS/sep`).
    Delete(DeleteArgs),

    /// Set one field of a node or separator.
    Set(SetArgs),

    /// Move a node one step among its siblings.
    Move(MoveArgs),
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// Name of the log in the store.
    key: String,
}

#[derive(Debug, Args)]
struct ShowArgs {
    key: String,
    /// Emit JSON instead of a human-readable listing.
    #[arg(long)]
    json: bool,
    /// Keep only nodes matching this text, with their ancestors.
    #[arg(long)]
    query: Option<String>,
    /// Inclusive start date filter (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date filter (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    key: String,
    /// JSON file holding an array of entries.
    file: PathBuf,
    #[arg(long, default_value = "replace")]
    mode: ImportMode,
}

#[derive(Debug, Args)]
struct AddEntryArgs {
    key: String,
    #[arg(long, value_parser = parse_kind, default_value = "chapter")]
    kind: EntryKind,
    #[arg(long)]
    title: String,
    #[arg(long)]
    date: Option<String>,
    /// Insert after this entry index. Appends otherwise.
    #[arg(long)]
    after: Option<usize>,
}

#[derive(Debug, Args)]
struct AddSectionArgs {
    key: String,
    /// Entry, section or subsection address (`0`, `0.1`, `0.1.2`).
    parent: NodeAddress,
    #[arg(long)]
    name: String,
    #[arg(long)]
    date: Option<String>,
    /// Insert after this sibling index. Appends otherwise.
    #[arg(long)]
    after: Option<usize>,
}

#[derive(Debug, Args)]
struct AddItemArgs {
    key: String,
    /// Section, subsection or sub-subsection address.
    parent: NodeAddress,
    /// Item type, or a graded-work kind to embed an entry.
    #[arg(long = "type")]
    kind: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    number: Option<String>,
    #[arg(long)]
    page: Option<String>,
    #[arg(long)]
    date: Option<String>,
    /// Insert after this item index. Prepends otherwise.
    #[arg(long)]
    after: Option<usize>,
}

#[derive(Debug, Args)]
struct SeparatorArgs {
    key: String,
    node: NodeAddress,
    #[arg(long, required_unless_present = "remove")]
    content: Option<String>,
    #[arg(long)]
    date: Option<String>,
    /// Remove the existing separator instead.
    #[arg(long, conflicts_with_all = ["content", "date"])]
    remove: bool,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    key: String,
    address: Address,
}

#[derive(Debug, Args)]
struct SetArgs {
    key: String,
    address: Address,
    /// title, date, remark, type, number, description, page or content.
    field: Field,
    /// New value. Empty clears optional fields.
    value: String,
}

#[derive(Debug, Args)]
struct MoveArgs {
    key: String,
    node: NodeAddress,
    #[arg(value_enum)]
    direction: MoveDirection,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MoveDirection {
    Up,
    Down,
}

impl From<MoveDirection> for Direction {
    fn from(value: MoveDirection) -> Self {
        match value {
            MoveDirection::Up => Direction::Up,
            MoveDirection::Down => Direction::Down,
        }
    }
}

fn parse_kind(raw: &str) -> Result<EntryKind, String> {
    EntryKind::parse(raw).ok_or_else(|| {
        let known: Vec<_> = EntryKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown entry kind {raw:?}, expected one of {}", known.join(", "))
    })
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "cahier=debug" } else { "cahier=warn" };
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    init_tracing(verbose);

    let config = CliConfig::load();
    let store = FileStore::new(cli.store.unwrap_or_else(|| config.store_dir()));
    if verbose {
        eprintln!("Using store {:?}", store.root());
    }
    let ctx = Setup {
        store,
        capacity: config.history_capacity,
    };

    match cli.command {
        Commands::Show(args) => handle_show(&ctx, args),
        Commands::Validate(args) => handle_validate(&ctx, args),
        Commands::Import(args) => handle_import(ctx, args, verbose),
        Commands::AddEntry(args) => handle_add_entry(ctx, args, verbose),
        Commands::AddSection(args) => handle_add_section(ctx, args, verbose),
        Commands::AddItem(args) => handle_add_item(ctx, args, verbose),
        Commands::Separator(args) => handle_separator(ctx, args, verbose),
        Commands::Delete(args) => handle_delete(ctx, args, verbose),
        Commands::Set(args) => handle_set(ctx, args, verbose),
        Commands::Move(args) => handle_move(ctx, args, verbose),
    }
}

/// Store and history settings shared by every subcommand.
struct Setup<S> {
    store: S,
    capacity: usize,
}

/// One editing session over a stored log: load, edit through history, save if changed.
struct Session<S: DocumentStore> {
    store: S,
    key: String,
    history: History,
}

impl<S: DocumentStore> Session<S> {
    /// Refuses to open a log it cannot read, so a bad file is never overwritten.
    fn open(ctx: Setup<S>, key: &str) -> Result<Self> {
        let (doc, problem) = ctx.store.load(key)?;
        if let Some(err) = problem {
            bail!("log {key:?} is unreadable ({err}); fix or re-import it first");
        }
        Ok(Self {
            store: ctx.store,
            key: key.to_string(),
            history: History::with_capacity(doc, ctx.capacity),
        })
    }

    /// Applies one edit. Returns `Ok(false)` with the reason printed when nothing changed.
    fn edit<F, R>(&mut self, label: &str, verbose: bool, f: F) -> Result<bool>
    where
        F: FnOnce(&cahier::Document) -> R,
        R: IntoEdit,
    {
        let mut missed = None;
        let changed = self
            .history
            .apply(label, |doc| {
                let edit = f(doc).into_edit()?;
                if let Edit::Unchanged(miss) = &edit {
                    missed = Some(*miss);
                }
                Ok::<_, EditError>(edit)
            })
            .with_context(|| format!("{label} in {:?}", self.key))?;
        if changed {
            self.store.save(&self.key, self.history.current())?;
            if verbose {
                eprintln!("{label}: saved {:?}", self.key);
            }
        } else {
            match missed {
                Some(miss) => eprintln!("{label}: no change ({miss})"),
                None => eprintln!("{label}: no change"),
            }
        }
        Ok(changed)
    }
}

fn handle_show(ctx: &Setup<FileStore>, args: ShowArgs) -> Result<()> {
    let ShowArgs {
        key,
        json,
        query,
        from,
        to,
    } = args;
    let (doc, problem) = ctx.store.load(&key)?;
    if let Some(err) = problem {
        eprintln!("warning: {err}; showing an empty log");
    }
    let doc = match query.as_deref() {
        Some(q) => filter_document(&doc, q),
        None => doc,
    };
    let rows = within_dates(group_by_date(flatten(&doc)), from, to);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        eprintln!("Nothing to show for {key:?}.");
        return Ok(());
    }
    for grouped in &rows {
        let row = &grouped.row;
        if grouped.starts_date_group {
            println!("[{}]", row.date().unwrap_or_default());
        }
        let indent = "  ".repeat(row.depth());
        let tail = match row.kind {
            RowKind::Separator => format!(
                "--- {} {}",
                row.node.heading(),
                row.date().unwrap_or_default()
            ),
            _ => row.node.heading().to_string(),
        };
        println!(
            "{:<12} {indent}{:<24} {}",
            row.address.to_string(),
            row.kind.label(),
            tail.trim_end()
        );
    }
    Ok(())
}

/// Keeps rows whose date group falls inside the range. Rows before the first dated row
/// belong to no group and are dropped once a bound is given.
fn within_dates<'a>(
    rows: Vec<GroupedRow<'a>>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<GroupedRow<'a>> {
    if from.is_none() && to.is_none() {
        return rows;
    }
    let mut current: Option<NaiveDate> = None;
    rows.into_iter()
        .filter(|grouped| {
            if grouped.starts_date_group {
                current = grouped.row.parsed_date();
            }
            current.is_some_and(|d| from.is_none_or(|f| d >= f) && to.is_none_or(|t| d <= t))
        })
        .collect()
}

fn handle_validate(ctx: &Setup<FileStore>, args: KeyArgs) -> Result<()> {
    let (doc, problem) = ctx.store.load(&args.key)?;
    if let Some(err) = problem {
        bail!("log {:?} is unreadable: {err}", args.key);
    }
    let issues = validate(&doc);
    if issues.is_empty() {
        println!("{}: {} entries, no issues", args.key, doc.len());
        return Ok(());
    }
    for issue in &issues {
        println!("{issue}");
    }
    bail!("{} schema issue(s) in {:?}", issues.len(), args.key)
}

fn handle_import(ctx: Setup<FileStore>, args: ImportArgs, verbose: bool) -> Result<()> {
    let ImportArgs { key, file, mode } = args;
    let text = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let incoming = load_str(&text).with_context(|| format!("importing {:?}", file))?;
    if verbose {
        eprintln!("Importing {} entries from {:?}", incoming.len(), file);
    }
    let mut session = match mode {
        ImportMode::Append => Session::open(ctx, &key)?,
        // Replacing must work even when the stored log is unreadable.
        ImportMode::Replace => Session {
            store: ctx.store,
            key: key.clone(),
            history: History::with_capacity(cahier::Document::new(), ctx.capacity),
        },
    };
    let changed = session.edit("import", verbose, |doc| merge(doc, incoming, mode))?;
    if !changed && mode == ImportMode::Replace {
        session.store.save(&key, session.history.current())?;
    }
    Ok(())
}

fn handle_add_entry(ctx: Setup<FileStore>, args: AddEntryArgs, verbose: bool) -> Result<()> {
    let mut session = Session::open(ctx, &args.key)?;
    let mut entry = TopLevelEntry::new(args.kind, args.title);
    entry.date = args.date;
    session.edit("add entry", verbose, |doc| {
        mutations::insert_entry(doc, entry, args.after)
    })?;
    Ok(())
}

fn handle_add_section(ctx: Setup<FileStore>, args: AddSectionArgs, verbose: bool) -> Result<()> {
    let AddSectionArgs {
        key,
        parent,
        name,
        date,
        after,
    } = args;
    let mut session = Session::open(ctx, &key)?;
    session.edit("add section", verbose, |doc| match parent {
        NodeAddress::Entry { .. } => {
            let mut section = Section::new(name);
            section.date = date;
            mutations::insert_section(doc, parent, section, after)
        }
        NodeAddress::Section { .. } => {
            let mut section = SubSection::new(name);
            section.date = date;
            mutations::insert_subsection(doc, parent, section, after)
        }
        _ => {
            let mut section = SubSubSection::new(name);
            section.date = date;
            mutations::insert_subsubsection(doc, parent, section, after)
        }
    })?;
    Ok(())
}

fn handle_add_item(ctx: Setup<FileStore>, args: AddItemArgs, verbose: bool) -> Result<()> {
    let AddItemArgs {
        key,
        parent,
        kind,
        title,
        number,
        page,
        date,
        after,
    } = args;
    let mut session = Session::open(ctx, &key)?;
    let item = match EntryKind::parse(&kind).filter(|k| k.is_embeddable()) {
        Some(kind) => {
            let mut embedded = EmbeddedEntry::new(kind, title);
            embedded.date = date;
            cahier::ItemEntry::Embedded(embedded)
        }
        None => {
            let mut item = Item::new(&kind, title);
            item.number = number;
            item.page = page;
            item.date = date;
            cahier::ItemEntry::Item(item)
        }
    };
    session.edit("add item", verbose, |doc| {
        mutations::insert_item(doc, parent, item, after)
    })?;
    Ok(())
}

fn handle_separator(ctx: Setup<FileStore>, args: SeparatorArgs, verbose: bool) -> Result<()> {
    let SeparatorArgs {
        key,
        node,
        content,
        date,
        remove,
    } = args;
    let mut session = Session::open(ctx, &key)?;
    if remove {
        session.edit("remove separator", verbose, |doc| {
            mutations::delete_separator(doc, node)
        })?;
        return Ok(());
    }
    let mut separator = Separator::new(content.unwrap_or_default(), true);
    separator.date = date;
    session.edit("add separator", verbose, |doc| {
        mutations::attach_separator(doc, node, separator)
    })?;
    Ok(())
}

fn handle_delete(ctx: Setup<FileStore>, args: DeleteArgs, verbose: bool) -> Result<()> {
    let mut session = Session::open(ctx, &args.key)?;
    session.edit("delete", verbose, |doc| {
        mutations::delete_node(doc, &args.address)
    })?;
    Ok(())
}

fn handle_set(ctx: Setup<FileStore>, args: SetArgs, verbose: bool) -> Result<()> {
    let SetArgs {
        key,
        address,
        field,
        value,
    } = args;
    let mut session = Session::open(ctx, &key)?;
    session.edit("set", verbose, |doc| {
        mutations::update_field(doc, &address, field, &value)
    })?;
    Ok(())
}

fn handle_move(ctx: Setup<FileStore>, args: MoveArgs, verbose: bool) -> Result<()> {
    let mut session = Session::open(ctx, &args.key)?;
    session.edit("move", verbose, |doc| {
        mutations::move_node(doc, args.node, args.direction.into())
    })?;
    Ok(())
}
