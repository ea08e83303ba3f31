use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use opzen::billing::PaymentEvent;
use opzen::gateway::run_gateway;
use opzen::jobs::spawn_sweeper;
use opzen::session::{Credentials, SessionStore};
use opzen::store::{IdentityId, JobId};
use opzen::{Config, CoreError, CreditService};

#[derive(Parser)]
#[command(name = "opzen", version, about = "Credit ledger and job lifecycle for OPZEN AI tools")]
struct Cli {
    /// Path to config.toml (defaults to $OPZEN_CONFIG or the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List the plan catalog.
    Plans,

    /// Show the balance of an identity.
    Balance { identity: String },

    /// Balance plus the active plan of an identity.
    Status { identity: String },

    /// Show recent ledger transactions of an identity.
    History {
        identity: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Grant credits to an identity.
    Grant {
        identity: String,
        amount: u64,

        #[arg(long, default_value = "Manual grant")]
        reason: String,

        /// Correlation key; a repeated grant with the same key is a no-op.
        #[arg(long)]
        key: Option<String>,
    },

    /// Check the stored balance against the transaction log.
    Reconcile { identity: String },

    /// Open a job for a tool and charge its estimated cost.
    Invoke {
        identity: String,
        tool: String,
        cost: u64,
    },

    /// Report the outcome of a job.
    Report {
        job: String,

        /// The tool failed; its debit is reversed.
        #[arg(long)]
        failed: bool,

        /// Actual cost, when it differs from the estimate.
        #[arg(long)]
        actual_cost: Option<u64>,
    },

    /// Reap stale pending jobs and restore their credits.
    Sweep {
        /// Staleness threshold (defaults to jobs.stale_after_secs).
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Print bank-transfer instructions for a plan.
    Checkout {
        plan: String,

        #[arg(long)]
        identity: Option<String>,
    },

    /// Apply a payment event given as JSON.
    ApplyPayment { json: String },

    /// List payments waiting in the guest bucket.
    GuestPayments,

    /// Move a guest-held payment to an identity.
    ClaimGuest {
        payment: String,
        identity: String,

        /// Audit note recorded with the migration.
        #[arg(long)]
        note: String,
    },

    /// Sign in and persist the session.
    Login {
        #[arg(long)]
        email: String,

        #[arg(long, env = "OPZEN_PASSWORD", hide_env_values = true)]
        password: String,

        /// Create the account first.
        #[arg(long)]
        sign_up: bool,
    },

    /// Sign out and clear the persisted session.
    Logout,

    /// Show the signed-in identity and its status.
    Whoami {
        /// OAuth redirect fragment to adopt (`access_token=...&refresh_token=...`).
        #[arg(long)]
        fragment: Option<String>,
    },

    /// Run the payment webhook gateway and the periodic job sweeper.
    Serve,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a config file with default values.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the JSON schema of the config file.
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opzen=info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    let command = match cli.command {
        Commands::Config { action } => return config_command(&action, &config_path),
        other => other,
    };
    let config = Config::load(&config_path)?;

    match command {
        Commands::Config { action } => config_command(&action, &config_path)?,
        Commands::Plans => {
            for plan in CreditService::open(&config)?.plans() {
                println!(
                    "  {:<14} {:<8} {:>7} credits  {:>10} {}  {} month(s)",
                    plan.id, plan.name, plan.credits, plan.price, plan.currency, plan.duration_months
                );
            }
        }
        Commands::Balance { identity } => {
            let service = CreditService::open(&config)?;
            let balance = service
                .request_balance(Some(&IdentityId::from(identity)))
                .await?;
            println!("{balance}");
        }
        Commands::Status { identity } => {
            let service = CreditService::open(&config)?;
            print_json(&service.user_status(&IdentityId::from(identity)).await?)?;
        }
        Commands::History { identity, limit } => {
            let service = CreditService::open(&config)?;
            let history = service
                .ledger()
                .history(&IdentityId::from(identity), limit)
                .await?;
            for tx in history {
                println!(
                    "{}  {:>+8}  {}  {}",
                    tx.created_at.format("%Y-%m-%d %H:%M:%S"),
                    tx.amount,
                    tx.id,
                    tx.reason
                );
            }
        }
        Commands::Grant {
            identity,
            amount,
            reason,
            key,
        } => {
            let service = CreditService::open(&config)?;
            let key = key.unwrap_or_else(|| format!("manual:{}", uuid::Uuid::new_v4()));
            let receipt = service
                .ledger()
                .grant(&IdentityId::from(identity), amount, &reason, &key)
                .await?;
            print_json(&receipt)?;
        }
        Commands::Reconcile { identity } => {
            let service = CreditService::open(&config)?;
            let report = service
                .ledger()
                .reconcile(&IdentityId::from(identity))
                .await?;
            print_json(&report)?;
            if !report.consistent {
                bail!("balance does not match the transaction log");
            }
        }
        Commands::Invoke {
            identity,
            tool,
            cost,
        } => {
            let service = CreditService::open(&config)?;
            let invocation = service
                .invoke_tool(&IdentityId::from(identity), &tool, cost)
                .await?;
            print_json(&invocation)?;
        }
        Commands::Report {
            job,
            failed,
            actual_cost,
        } => {
            let service = CreditService::open(&config)?;
            let outcome = service
                .report_outcome(&JobId::from(job), !failed, actual_cost)
                .await?;
            print_json(&outcome)?;
        }
        Commands::Sweep { older_than_secs } => {
            let service = CreditService::open(&config)?;
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.jobs.stale_after());
            let report = service.jobs().sweep_stale(older_than, None).await?;
            print_json(&report)?;
        }
        Commands::Checkout { plan, identity } => {
            let service = CreditService::open(&config)?;
            let identity = identity.map(IdentityId::from);
            print_json(&service.request_purchase(identity.as_ref(), &plan)?)?;
        }
        Commands::ApplyPayment { json } => {
            let event: PaymentEvent =
                serde_json::from_str(&json).context("Invalid payment event JSON")?;
            let service = CreditService::open(&config)?;
            match service.reconciler().apply(&event).await {
                Ok(confirmation) => println!("{}", confirmation.message()),
                Err(CoreError::UnknownIdentity { payment_id }) => {
                    println!("Payment {payment_id} held in the guest bucket");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::GuestPayments => {
            let service = CreditService::open(&config)?;
            print_json(&service.reconciler().guest_payments().await?)?;
        }
        Commands::ClaimGuest {
            payment,
            identity,
            note,
        } => {
            let service = CreditService::open(&config)?;
            let confirmation = service
                .reconciler()
                .claim_guest_payment(&payment, &IdentityId::from(identity), &note)
                .await?;
            println!("{}", confirmation.message());
        }
        Commands::Login {
            email,
            password,
            sign_up,
        } => {
            let service = CreditService::open(&config)?;
            let sessions = SessionStore::from_config(&config)?;
            let mut changes = sessions.subscribe();
            let credentials = if sign_up {
                Credentials::SignUp { email, password }
            } else {
                Credentials::Password { email, password }
            };
            let session = sessions.sign_in(&credentials).await?;
            println!("Signed in as {}", session.identity.id);
            if let Ok(change) = changes.try_recv() {
                if let Some(status) = service.on_session_change(&change).await {
                    print_json(&status)?;
                }
            }
        }
        Commands::Logout => {
            let sessions = SessionStore::from_config(&config)?;
            sessions.restore(None).await?;
            sessions.sign_out().await;
            println!("Signed out");
        }
        Commands::Whoami { fragment } => {
            let service = CreditService::open(&config)?;
            let sessions = SessionStore::from_config(&config)?;
            match sessions.restore(fragment.as_deref()).await? {
                Some(session) => print_json(&service.user_status(session.identity_id()).await?)?,
                None => println!("Not signed in"),
            }
        }
        Commands::Serve => serve(config).await?,
    }

    Ok(())
}

fn config_command(action: &ConfigAction, path: &std::path::Path) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            Config::default().save(path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        ConfigAction::Schema => print_json(&Config::json_schema()),
    }
}

async fn serve(config: Config) -> Result<()> {
    let service = Arc::new(CreditService::open(&config)?);
    let cancel = CancellationToken::new();

    let sweeper = spawn_sweeper(
        Arc::clone(service.jobs()),
        config.jobs.sweep_interval(),
        config.jobs.stale_after(),
        config.jobs.retention(),
        cancel.clone(),
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
        }
        shutdown.cancel();
    });

    let result = run_gateway(&config, service, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Sweeper task ended abnormally");
    }
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
