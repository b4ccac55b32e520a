use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "objsync")]
#[command(about = "Inspect and administer objsync partners, collections and device states")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the sync database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or migrate the database and print its location
    Init,
    /// Show the commit head of every stream
    Heads {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write objects to the entity store
    Objects {
        #[command(subcommand)]
        command: ObjectCommands,
    },
    /// Manage sync partners
    Partners {
        #[command(subcommand)]
        command: PartnerCommands,
    },
    /// Manage partner collections
    Collections {
        #[command(subcommand)]
        command: CollectionCommands,
    },
    /// Manage device states and user links
    Devices {
        #[command(subcommand)]
        command: DeviceCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ObjectCommands {
    /// Create or update an object, assigning it the next commit id
    Put {
        /// Stream key: `type` or `type/field`
        stream: String,
        /// Object id
        id: String,
        /// Fields as a JSON object
        #[arg(default_value = "{}")]
        fields: String,
        /// Hierarchical parent id
        #[arg(long)]
        parent: Option<String>,
    },
    /// Soft delete an object
    Delete {
        /// Stream key: `type` or `type/field`
        stream: String,
        /// Object id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum PartnerCommands {
    /// List partners
    List {
        /// Only partners of this owner
        #[arg(long)]
        owner: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Register a partner
    Add {
        /// Partner key, e.g. `EmailAccounts/42`
        pid: String,
        /// Owning principal
        owner: String,
    },
    /// Delete a partner with all of its collections
    Delete {
        /// Partner key
        pid: String,
    },
}

#[derive(Subcommand)]
pub enum CollectionCommands {
    /// List the collections of a partner
    List {
        /// Partner key
        pid: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ensure a partner has a collection for a stream
    Add {
        /// Partner key
        pid: String,
        /// Object type
        object_type: String,
        /// Grouping field; makes this a grouping collection
        #[arg(long)]
        field: Option<String>,
        /// Filter conditions as a JSON array
        #[arg(long)]
        conditions: Option<String>,
    },
    /// Show the next export batch without acknowledging it
    Pending {
        /// Collection id
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export and acknowledge the next batch, printing each change
    Export {
        /// Collection id
        id: i64,
        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Move a grouping collection's watermark to the stream head
    FastForward {
        /// Collection id
        id: i64,
    },
    /// Remove a collection
    Remove {
        /// Collection id
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// List devices, globally or for one user
    List {
        /// Only devices linked to this user
        #[arg(long)]
        user: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List devices with states but no linked user
    Orphans,
    /// List users linked to a device
    Users {
        /// Device id
        device: String,
    },
    /// Link a user to a device
    Link {
        /// Username
        user: String,
        /// Device id
        device: String,
    },
    /// Unlink a user from a device
    Unlink {
        /// Username
        user: String,
        /// Device id
        device: String,
    },
    /// Delete device state generations
    Clean {
        /// Device id
        device: String,
        /// State type
        state_type: String,
        /// Session uuid
        #[arg(long)]
        uuid: Option<String>,
        /// Generation; without it every generation is deleted
        #[arg(long)]
        counter: Option<i64>,
        /// Delete only the given generation instead of all older ones
        #[arg(long, requires = "counter")]
        only: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
