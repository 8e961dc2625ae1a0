use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::models::context::ConnectionContext;

/// Out-of-band login approval over Telegram
#[derive(Parser)]
#[command(name = "loginguard", version, about)]
pub struct Cli {
    /// Env file to load before reading the environment
    #[arg(long, global = true, env = "LOGINGUARD_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask the operator to approve this login (default)
    Authenticate(ContextArgs),

    /// Check the bot token and chat configuration
    Ping,

    /// Print the challenge that would be sent, without sending it
    Context(ContextArgs),
}

/// Overrides for the PAM_* variables exported by the host framework.
#[derive(Args, Default, Clone)]
pub struct ContextArgs {
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub rhost: Option<String>,
    #[arg(long)]
    pub ruser: Option<String>,
    #[arg(long)]
    pub service: Option<String>,
    #[arg(long)]
    pub tty: Option<String>,
}

impl ContextArgs {
    pub fn apply(self, mut ctx: ConnectionContext) -> ConnectionContext {
        ctx.user = self.user.or(ctx.user);
        ctx.remote_host = self.rhost.or(ctx.remote_host);
        ctx.remote_user = self.ruser.or(ctx.remote_user);
        ctx.service = self.service.or(ctx.service);
        ctx.tty = self.tty.or(ctx.tty);
        ctx
    }
}
