use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "classdb")]
#[command(about = "Index JVM libraries and query classes, hierarchy and member usages")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "FILE")]
    pub db: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Register and index jars or class directories.
    Load {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Re-index libraries whose content changed.
    Refresh,
    /// Remove libraries from the index.
    Unload {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Look up a class by fully qualified name.
    Find {
        class_name: String,

        /// Restrict the lookup to these libraries, in precedence order.
        #[arg(long = "classpath", value_name = "PATH")]
        classpath: Vec<PathBuf>,
    },
    /// List subclasses and implementors of a type.
    Subclasses {
        class_name: String,

        #[arg(long)]
        all: bool,
    },
    /// List methods statically referencing a member.
    Usages {
        owner: String,
        name: String,
        descriptor: Option<String>,
    },
    Stats,
    Clear,
}
