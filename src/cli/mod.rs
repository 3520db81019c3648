//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod commands;

/// Fleet - crash-safe coordination for multi-agent coding missions
#[derive(Parser, Debug)]
#[command(name = "fleet", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.fleet/data/fleet.db)
    #[arg(long, global = true, env = "FLEET_DB")]
    pub db: Option<PathBuf>,

    /// Acting agent or user
    #[arg(long, global = true, env = "FLEET_ACTOR")]
    pub actor: Option<String>,

    /// Output as JSON (for agent integration)
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the Fleet database
    Init {
        /// Re-initialize an existing database location
        #[arg(long)]
        force: bool,
    },

    /// Print version information
    Version,

    /// Mission management
    Mission {
        #[command(subcommand)]
        command: MissionCommands,
    },

    /// Sortie management
    Sortie {
        #[command(subcommand)]
        command: SortieCommands,
    },

    /// Event log
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Consumer cursors
    Cursor {
        #[command(subcommand)]
        command: CursorCommands,
    },

    /// Resource locks
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Agent mailboxes
    Mail {
        #[command(subcommand)]
        command: MailCommands,
    },

    /// Save a checkpoint of a mission
    Checkpoint(CheckpointArgs),

    /// Inspect and prune checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointsCommands,
    },

    /// Resume a mission from a checkpoint
    Resume(ResumeArgs),

    /// Find stalled missions
    Recover {
        #[command(subcommand)]
        command: RecoverCommands,
    },

    /// Agent registry
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Assign work to the best available agent
    Dispatch(DispatchArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Serve the REST API
    #[cfg(feature = "server")]
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7420")]
        bind: String,
    },
}

/// Supported shells for completions.
#[derive(ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

// ============================================================================
// Mission Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum MissionCommands {
    /// Create a mission
    Create {
        /// Mission title
        title: String,

        /// Explicit mission ID (default: generated)
        #[arg(long)]
        id: Option<String>,

        /// Description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// List missions
    List {
        /// Filter by status (pending, in_progress, review, completed, cancelled)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show a mission with its sorties
    Show {
        /// Mission ID
        id: String,
    },

    /// Move a mission to a new status
    Status {
        /// Mission ID
        id: String,

        /// New status
        status: String,
    },
}

// ============================================================================
// Sortie Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum SortieCommands {
    /// Add a sortie to a mission
    Add {
        /// Mission ID
        mission: String,

        /// Sortie title
        title: String,

        /// Files this sortie touches (comma-separated)
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
    },

    /// List a mission's sorties
    List {
        /// Mission ID
        mission: String,
    },

    /// Assign a sortie to an agent
    Assign {
        /// Sortie ID
        id: String,

        /// Agent ID
        agent: String,
    },

    /// Report progress on a sortie (as the assigned agent, see --actor)
    Progress {
        /// Sortie ID
        id: String,

        /// New status
        #[arg(short, long)]
        status: Option<String>,

        /// Progress percentage (0-100)
        #[arg(short, long)]
        progress: Option<u8>,

        /// Progress notes
        #[arg(short, long)]
        notes: Option<String>,
    },
}

// ============================================================================
// Event / Cursor Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Append an event to a stream
    Append {
        /// Stream type (e.g. mission, mailbox)
        stream_type: String,

        /// Stream ID
        stream_id: String,

        /// Event type
        event_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,

        /// Fail unless the stream head is exactly this position
        #[arg(long)]
        expect_head: Option<i64>,
    },

    /// List events of a stream
    List {
        /// Stream type
        stream_type: String,

        /// Stream ID
        stream_id: String,

        /// Only events after this position
        #[arg(long)]
        from: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CursorCommands {
    /// Advance a consumer cursor
    Advance {
        /// Consumer ID
        consumer: String,

        /// Stream ID
        stream: String,

        /// New position
        position: i64,
    },

    /// Read a consumer cursor
    Get {
        /// Consumer ID
        consumer: String,

        /// Stream ID
        stream: String,
    },
}

// ============================================================================
// Lock Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Acquire a lock on a resource (as --actor)
    Acquire {
        /// Resource, usually a file path
        resource: String,

        /// Timeout in milliseconds (default: FLEET_LOCK_TIMEOUT_MS or 30 minutes)
        #[arg(long)]
        timeout_ms: Option<i64>,

        /// Why the lock is held
        #[arg(long)]
        purpose: Option<String>,
    },

    /// Release a lock you hold
    Release {
        /// Lock ID
        id: String,
    },

    /// Release a lock regardless of holder
    ForceRelease {
        /// Lock ID
        id: String,

        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List live locks
    List,
}

// ============================================================================
// Mail Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum MailCommands {
    /// Send a message (from --actor)
    Send {
        /// Recipients (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        to: Vec<String>,

        /// Subject
        #[arg(short, long)]
        subject: String,

        /// Body
        #[arg(short, long, default_value = "")]
        body: String,

        /// Mission the message belongs to
        #[arg(short, long)]
        mission: Option<String>,
    },

    /// Show undelivered messages for --actor
    Inbox,

    /// Acknowledge a message as --actor
    Ack {
        /// Message ID
        id: String,
    },
}

// ============================================================================
// Checkpoint Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct CheckpointArgs {
    /// Mission ID (default: the only in-progress mission)
    #[arg(short, long)]
    pub mission: Option<String>,

    /// What was just done, for whoever resumes
    #[arg(short, long)]
    pub note: Option<String>,

    /// Trigger (progress, error, manual, compaction)
    #[arg(short, long, default_value = "manual")]
    pub trigger: String,

    /// Override the sortie-derived progress percentage
    #[arg(short, long)]
    pub progress: Option<i64>,

    /// Next step (repeatable)
    #[arg(long = "next-step")]
    pub next_steps: Vec<String>,

    /// Known blocker (repeatable)
    #[arg(long = "blocker")]
    pub blockers: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointsCommands {
    /// List checkpoints
    List {
        /// Filter by mission
        #[arg(short, long)]
        mission: Option<String>,

        /// Maximum checkpoints to return
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show checkpoint details
    Show {
        /// Checkpoint ID
        id: String,
    },

    /// Delete old checkpoints, always keeping the newest per mission
    Prune {
        /// Only prune this mission
        #[arg(short, long)]
        mission: Option<String>,

        /// Age threshold in days
        #[arg(long, default_value = "7")]
        older_than: u32,

        /// Checkpoints to keep per mission regardless of age
        #[arg(long, default_value = "3")]
        keep: u32,

        /// Show what would be deleted
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Checkpoint to restore
    #[arg(short, long, conflicts_with = "mission")]
    pub checkpoint: Option<String>,

    /// Restore the newest unconsumed checkpoint of this mission
    #[arg(short, long)]
    pub mission: Option<String>,

    /// Preview without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Take over locks now held by other agents
    #[arg(long)]
    pub force_locks: bool,

    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(Subcommand, Debug)]
pub enum RecoverCommands {
    /// List stalled in-progress missions
    Detect {
        /// Inactivity threshold (default: FLEET_ACTIVITY_THRESHOLD_MS or 300000)
        #[arg(long)]
        threshold_ms: Option<i64>,
    },
}

// ============================================================================
// Agent / Dispatch Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Register or update an agent
    Register {
        /// Agent ID
        id: String,

        /// Display name
        #[arg(long, default_value = "")]
        name: String,

        /// Capabilities (comma-separated)
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Maximum concurrent assignments
        #[arg(long, default_value = "1")]
        capacity: u32,
    },

    /// List agents in registration order
    List,
}

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// Kind of work (matched against agent capabilities)
    pub work_type: String,

    /// Free-text description
    #[arg(short, long, default_value = "")]
    pub description: String,

    /// Priority (low, medium, high, critical)
    #[arg(short, long, default_value = "medium")]
    pub priority: String,

    /// Assign this sortie to the chosen agent
    #[arg(long)]
    pub sortie: Option<String>,
}
