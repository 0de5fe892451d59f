use anyhow::{Context, Result};
use clap::Parser;
use classdb::cli::{Cli, Commands};
use classdb::config::{clear_db, resolve_db_path};
use classdb::feature::Feature;
use classdb::model::{FieldRecord, MethodRecord};
use classdb::{ClassRecord, Selection, Session, SessionSettings, Usages};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = resolve_db_path(&cli)?;
            clear_db(&db_path)?;
        }
        Commands::Stats => {
            let session = open_session(&cli)?;
            print_json(&session.stats()?)?;
        }
        Commands::Load { paths } => {
            let session = open_session(&cli)?;
            let report = session.load(&paths)?.wait()?;
            session.await_background_jobs()?.wait()?;
            print_json(&report)?;
        }
        Commands::Refresh => {
            let session = open_session(&cli)?;
            let report = session.refresh()?.wait()?;
            session.await_background_jobs()?.wait()?;
            print_json(&report)?;
        }
        Commands::Unload { paths } => {
            let session = open_session(&cli)?;
            let report = session.unload(&paths)?.wait()?;
            print_json(&report)?;
        }
        Commands::Find {
            class_name,
            classpath,
        } => {
            let session = open_session(&cli)?;
            let selection = if classpath.is_empty() {
                Selection::All
            } else {
                Selection::explicit(&classpath)
            };
            let snapshot = session.classpath(selection)?;
            let class = snapshot
                .find_class(&normalize_class_name(&class_name))
                .with_context(|| format!("Lookup failed for {class_name}"))?;
            print_json(&ClassView::from(class.as_ref()))?;
        }
        Commands::Subclasses { class_name, all } => {
            let session = open_session(&cli)?;
            let snapshot = session.classpath(Selection::All)?;
            let names: Vec<String> = snapshot
                .find_sub_classes(&normalize_class_name(&class_name), all)?
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            print_json(&names)?;
        }
        Commands::Usages {
            owner,
            name,
            descriptor,
        } => {
            let session = open_session(&cli)?;
            let snapshot = session.classpath(Selection::All)?;
            let usages = Usages::find_usages(
                &snapshot,
                &normalize_class_name(&owner),
                &name,
                descriptor.as_deref(),
            )?;
            print_json(&usages)?;
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("CLASSDB_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Opens the persistent session and waits for restore-time feature syncs.
fn open_session(cli: &Cli) -> Result<Session> {
    let db_path = resolve_db_path(cli)?;
    let mut settings = SessionSettings::new()
        .install_features([Arc::new(Usages::new()) as Arc<dyn Feature>])
        .persistent(db_path);
    if let Some(workers) = cli.workers {
        settings = settings.workers(workers);
    }
    let session = Session::open(settings).context("Failed to open class database")?;
    session.await_background_jobs()?.wait()?;
    Ok(session)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn normalize_class_name(raw: &str) -> String {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("import") {
        s = rest.trim();
    }
    if s.ends_with(';') {
        s = s.trim_end_matches(';').trim();
    }
    s.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .replace('/', ".")
}

#[derive(Debug, Serialize)]
struct ClassView<'a> {
    name: &'a str,
    super_class: Option<&'a str>,
    interfaces: &'a [String],
    access: u16,
    library: String,
    generation: u64,
    entry: &'a str,
    annotations: &'a [String],
    fields: &'a [FieldRecord],
    methods: Vec<MethodView<'a>>,
}

#[derive(Debug, Serialize)]
struct MethodView<'a> {
    name: &'a str,
    descriptor: &'a str,
    access: u16,
    references: usize,
}

impl<'a> From<&'a ClassRecord> for ClassView<'a> {
    fn from(class: &'a ClassRecord) -> Self {
        Self {
            name: class.name(),
            super_class: class.super_class(),
            interfaces: class.interfaces(),
            access: class.access().0,
            library: class.location().to_string(),
            generation: class.generation().0,
            entry: &class.entry,
            annotations: class.annotations(),
            fields: class.fields(),
            methods: class.methods().iter().map(MethodView::from).collect(),
        }
    }
}

impl<'a> From<&'a MethodRecord> for MethodView<'a> {
    fn from(method: &'a MethodRecord) -> Self {
        Self {
            name: &method.name,
            descriptor: &method.descriptor,
            access: method.access.0,
            references: method.references.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_class_name_strips_import_whitespace_and_semicolon() {
        assert_eq!(
            normalize_class_name(" import org.example.Foo ; "),
            "org.example.Foo"
        );
        assert_eq!(normalize_class_name("org/example/Bar"), "org.example.Bar");
    }

    #[test]
    fn cli_accepts_global_flags_before_subcommand() {
        let cli = Cli::parse_from([
            "classdb", "--db", "/tmp/x.lmdb", "--workers", "2", "usages", "b.B", "n",
        ]);
        assert_eq!(cli.workers, Some(2));
        assert!(matches!(
            cli.command,
            Commands::Usages { ref owner, ref descriptor, .. }
                if owner == "b.B" && descriptor.is_none()
        ));
    }
}
