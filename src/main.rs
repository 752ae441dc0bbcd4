use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use memoentity::metadata::{SlotKind, TypeLayout};
use memoentity::{Statement, TypeRegistry, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "memoentity")]
#[command(about = "Inspect entity descriptors and the statements they produce")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print tables, load groups, columns and per-group SELECTs
    Layout {
        /// JSON array of type descriptors
        file: PathBuf,
        /// Only show this type
        #[arg(long = "type")]
        type_name: Option<String>,
    },
    /// Validate a descriptor file and list its entity types
    Check { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Layout { file, type_name } => {
            let registry = load_registry(&file)?;
            let layouts = match type_name {
                Some(name) => vec![registry
                    .layout(&name)
                    .with_context(|| format!("type '{}' in {}", name, file.display()))?],
                None => {
                    let mut layouts = registry.layouts();
                    layouts.sort_by(|a, b| a.name().cmp(b.name()));
                    layouts
                }
            };
            for layout in layouts {
                print!("{}", render_layout(&layout));
            }
            Ok(())
        }
        Command::Check { file } => {
            let registry = load_registry(&file)?;
            let mut names: Vec<String> = registry
                .layouts()
                .iter()
                .map(|l| l.name().to_string())
                .collect();
            names.sort();
            println!("{}: {} entity types", file.display(), names.len());
            for name in names {
                println!("  {}", name);
            }
            Ok(())
        }
    }
}

fn load_registry(path: &Path) -> Result<TypeRegistry> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    TypeRegistry::builder()
        .register_json(&json)
        .and_then(|builder| builder.build())
        .map_err(|err| anyhow!("{}: {}", path.display(), err))
}

fn render_layout(layout: &TypeLayout) -> String {
    let mut out = String::new();
    out.push_str(&format!("{} (root {})\n", layout.name(), layout.root()));
    out.push_str(&format!("  chain:  {}\n", layout.chain().join(" -> ")));
    let tables: Vec<&str> = layout.tables().iter().map(|t| t.name.as_str()).collect();
    out.push_str(&format!("  tables: {}\n", tables.join(", ")));
    out.push_str(&format!(
        "  key:    {} ({:?})\n",
        layout.key_column_names().join(", "),
        layout.key_generation()
    ));
    if let Some(slot) = layout.version_slot() {
        out.push_str(&format!("  version: {}\n", slot.name));
    }
    if let Some(discriminator) = layout.discriminator() {
        out.push_str(&format!(
            "  discriminator: {} = {}\n",
            discriminator.column,
            discriminator.value.as_deref().unwrap_or("-")
        ));
    }

    let key_filter: Vec<(String, Value)> = layout
        .key_column_names()
        .into_iter()
        .map(|c| (c.to_string(), Value::Null))
        .collect();
    for group in layout.groups() {
        let columns: Vec<String> = layout
            .select_columns(group.index)
            .into_iter()
            .map(str::to_string)
            .collect();
        out.push_str(&format!(
            "  group {} [{} / {}]: {}\n",
            group.index,
            group.owner,
            group.table,
            columns.join(", ")
        ));
        if !columns.is_empty() {
            let select = Statement::select(group.table.clone(), columns, key_filter.clone());
            out.push_str(&format!("    {}\n", select.sql()));
        }
    }

    for slot in layout.slots() {
        if let SlotKind::OneToMany { target, mapped_by } = &slot.kind {
            out.push_str(&format!(
                "  collection {}: {} by {}\n",
                slot.name, target, mapped_by
            ));
        }
    }
    out
}
