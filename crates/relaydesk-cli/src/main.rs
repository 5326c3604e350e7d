mod admin;

use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use relaydesk_common::{AgentId, TenantId};
use relaydesk_config::ConfigLoader;
use tracing_subscriber::EnvFilter;

use crate::admin::Admin;

#[derive(Parser)]
#[command(
    name = "relaydesk",
    version,
    about = "RelayDesk - multi-tenant AI agent messaging backend"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); overrides config.yml
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Configuration directory
    #[arg(long, env = "RELAYDESK_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Query a running gateway
    Status,

    /// Create the config directory, storage layout and a default config.yml
    Init,

    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        action: TenantCommands,
    },

    /// Manage API tokens
    Token {
        #[command(subcommand)]
        action: TokenCommands,
    },

    /// Manage channels and provisioned channel accounts
    Channel {
        #[command(subcommand)]
        action: ChannelCommands,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Provision a tenant and its database
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        /// Create an operator account instead of a customer tenant
        #[arg(long)]
        admin: bool,
    },
    /// List all tenants
    List,
    /// Stop routing traffic to a tenant
    Deactivate { id: i64 },
    /// Resume routing traffic to a tenant
    Reactivate { id: i64 },
    /// Delete a tenant and its database
    Drop { id: i64 },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue a bearer token for a tenant
    Issue {
        #[arg(long)]
        tenant: i64,
    },
}

#[derive(Subcommand)]
enum ChannelCommands {
    /// List configured channels
    List,
    /// Provisioned channel accounts
    Account {
        #[command(subcommand)]
        action: AccountCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Assign a number, bot, page or inbox to a tenant
    Add {
        /// whatsapp, telegram, messenger or email
        #[arg(long)]
        channel: String,
        /// Provider-side account id (phone number id, bot username, page id, inbox)
        #[arg(long)]
        account: String,
        #[arg(long)]
        tenant: i64,
        /// Agent that answers on this account
        #[arg(long)]
        agent: Option<i64>,
    },
    /// List provisioned accounts
    List,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };
    let config = config_loader.load()?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_tracing(&level, cli.log_format);

    match cli.command {
        Commands::Start { host, port } => {
            config_loader.ensure_dirs()?;
            let mut config = config;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }

            let server = relaydesk_gateway::GatewayServer::new(config);
            server.run().await?;
        }
        Commands::Status => {
            let url = format!(
                "http://{}:{}/api/status",
                config.gateway.host, config.gateway.port
            );
            let resp = reqwest::get(&url).await.map_err(|_| {
                anyhow!(
                    "Gateway is not running at {}:{}",
                    config.gateway.host,
                    config.gateway.port
                )
            })?;
            if !resp.status().is_success() {
                bail!("gateway answered {}", resp.status());
            }
            let body = resp.json::<serde_json::Value>().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Init => {
            println!("RelayDesk setup");
            println!("Config directory: {}", config_loader.config_dir().display());
            match admin::write_default_config(&config_loader)? {
                Some(path) => println!(
                    "Wrote {}. Edit it to configure channels and LLM providers.",
                    path.display()
                ),
                None => println!("Existing config kept."),
            }
        }
        Commands::Tenant { action } => {
            let admin = Admin::open(&config)?;
            match action {
                TenantCommands::Create { email, name, admin: is_admin } => {
                    let tenant = admin.create_tenant(&email, &name, is_admin)?;
                    println!("{}", serde_json::to_string_pretty(&tenant)?);
                }
                TenantCommands::List => {
                    let tenants = admin.list_tenants()?;
                    if tenants.is_empty() {
                        println!("(no tenants - create one with `relaydesk tenant create`)");
                    }
                    for t in tenants {
                        let state = if t.active { "active" } else { "inactive" };
                        println!(
                            "  {} {} <{}> [{}] {}",
                            t.id,
                            t.name,
                            t.email,
                            t.role.as_str(),
                            state
                        );
                    }
                }
                TenantCommands::Deactivate { id } => {
                    admin.set_active(TenantId(id), false)?;
                    println!("tenant {id} deactivated");
                }
                TenantCommands::Reactivate { id } => {
                    admin.set_active(TenantId(id), true)?;
                    println!("tenant {id} reactivated");
                }
                TenantCommands::Drop { id } => {
                    admin.drop_tenant(TenantId(id))?;
                    println!("tenant {id} dropped");
                }
            }
        }
        Commands::Token { action } => match action {
            TokenCommands::Issue { tenant } => {
                if config.gateway.token_secret.is_none()
                    && std::env::var("RELAYDESK_TOKEN_SECRET").is_err()
                {
                    bail!(
                        "no token secret configured; set gateway.token_secret or \
                         RELAYDESK_TOKEN_SECRET so the gateway accepts the token"
                    );
                }
                let admin = Admin::open(&config)?;
                println!("{}", admin.issue_token(TenantId(tenant))?);
            }
        },
        Commands::Channel { action } => match action {
            ChannelCommands::List => {
                println!("Configured channels:");
                if config.channels.is_empty() {
                    println!("  (none - add channels to config.yml)");
                }
                for (name, ch) in config.enabled_channels() {
                    println!("  {} [{}] - enabled", name, ch.channel_type);
                }
            }
            ChannelCommands::Account { action } => {
                let admin = Admin::open(&config)?;
                match action {
                    AccountCommands::Add {
                        channel,
                        account,
                        tenant,
                        agent,
                    } => {
                        let account = admin.add_channel_account(
                            &channel,
                            &account,
                            TenantId(tenant),
                            agent.map(AgentId),
                        )?;
                        println!(
                            "{} account {} -> tenant {}",
                            account.channel_type, account.account_id, account.tenant_id
                        );
                    }
                    AccountCommands::List => {
                        let accounts = admin.list_channel_accounts()?;
                        if accounts.is_empty() {
                            println!("(no channel accounts)");
                        }
                        for a in accounts {
                            let agent = a
                                .agent_id
                                .map(|id| id.to_string())
                                .unwrap_or_else(|| "default".to_string());
                            println!(
                                "  {} {} -> tenant {} (agent {})",
                                a.channel_type, a.account_id, a.tenant_id, agent
                            );
                        }
                    }
                }
            }
        },
    }

    Ok(())
}
