//! Social Markets CLI
//!
//! Inspect the market database, run a monitoring cycle by hand, and try out
//! AI drafts without starting the server.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use social_markets::services::{CycleOutcome, SystemClock};
use social_markets::types::{MarketStatus, ProposalStatus};
use social_markets::wallet::{normalize_address, CredentialVault};
use social_markets::{Config, Database, Market, MarketDrafter, XClient, XMonitor};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "social-markets")]
#[command(about = "Community prediction markets with X-driven resolution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List markets
    Markets {
        /// Only "active" or "resolved" markets
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one market with its options and tracking records
    Market {
        id: String,
    },

    /// Show a wallet's stats and badges
    Stats {
        wallet: String,
    },

    /// Show the top predictors
    Leaderboard {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List community proposals
    Proposals {
        /// Only "proposed", "created" or "rejected"
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Run a single X monitoring cycle
    MonitorOnce,

    /// Draft a market from free text
    Draft {
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;

    match cli.command {
        Commands::Markets { status } => list_markets(&config, status.as_deref()).await?,
        Commands::Market { id } => show_market(&config, &id).await?,
        Commands::Stats { wallet } => show_stats(&config, &wallet).await?,
        Commands::Leaderboard { limit } => show_leaderboard(&config, limit).await?,
        Commands::Proposals { status } => list_proposals(&config, status.as_deref()).await?,
        Commands::MonitorOnce => monitor_once(&config).await?,
        Commands::Draft { text } => draft(&config, &text).await?,
    }

    Ok(())
}

fn header(title: &str) {
    println!("\n{}", "=".repeat(70));
    println!("  {}", title.bold());
    println!("{}\n", "=".repeat(70));
}

fn status_label(market: &Market) -> String {
    match market.status {
        MarketStatus::Active => "ACTIVE".green().to_string(),
        MarketStatus::Resolved => "RESOLVED".blue().to_string(),
    }
}

fn print_market_line(i: usize, market: &Market) {
    println!("{}. [{}] \"{}\"", i + 1, status_label(market), market.title);
    let odds: Vec<String> = market
        .options
        .iter()
        .zip(market.percentages())
        .map(|(o, pct)| format!("{} {}%", o.label, pct))
        .collect();
    println!(
        "   {} | Volume: {} | Participants: {} | Ends: {}",
        odds.join(" / "),
        market.total_volume,
        market.participants,
        market.end_date.format("%Y-%m-%d %H:%M")
    );
    if let Some(username) = &market.x_target_username {
        println!(
            "   Watching @{} ({})",
            username,
            market.x_monitoring_status.as_str()
        );
    }
}

async fn list_markets(config: &Config, status: Option<&str>) -> Result<()> {
    let filter = match status {
        Some(s) => Some(
            MarketStatus::parse(s).ok_or_else(|| anyhow::anyhow!("Unknown market status: {}", s))?,
        ),
        None => None,
    };

    header("MARKETS");
    let db = Database::new(&config.database_path).await?;
    let markets = db.list_markets(filter).await?;
    if markets.is_empty() {
        println!("No markets found.\n");
        return Ok(());
    }

    for (i, market) in markets.iter().enumerate() {
        print_market_line(i, market);
    }
    println!("\nTotal: {} markets\n", markets.len());
    Ok(())
}

async fn show_market(config: &Config, id: &str) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    let Some(market) = db.get_market(id).await? else {
        println!("{}", format!("Market {} not found", id).red());
        return Ok(());
    };

    header(&market.title);
    println!("Status:    {}", status_label(&market));
    println!("Creator:   {}", market.creator_wallet);
    println!("Category:  {}", market.category);
    println!("Ends:      {}", market.end_date.to_rfc3339());
    println!("Volume:    {} ({} participants)", market.total_volume, market.participants);

    println!("\nOptions:");
    for (option, pct) in market.options.iter().zip(market.percentages()) {
        let winner = market.winner_id.as_deref() == Some(option.id.as_str());
        let line = format!("  {:<30} {:>3}%  staked {}", option.label, pct, option.total_staked);
        if winner {
            println!("{} {}", line.green().bold(), "(winner)".green());
        } else {
            println!("{}", line);
        }
    }

    let records = db.tracking_for_market(&market.id).await?;
    if !records.is_empty() {
        println!("\nX Tracking:");
        for record in records {
            println!(
                "  @{} [{}] condition={} cursor={}",
                record.x_target_username,
                record.monitoring_status.as_str(),
                record.condition.kind(),
                record.last_checked_tweet_id.as_deref().unwrap_or("-")
            );
            if let Some(proof) = record.resolution_proof {
                println!("    proof: {}", proof.tweet_url.cyan());
            }
        }
    }
    println!();
    Ok(())
}

async fn show_stats(config: &Config, wallet: &str) -> Result<()> {
    let wallet = normalize_address(wallet)?;
    let db = Database::new(&config.database_path).await?;
    let stats = db.user_stats(&wallet).await?;
    let badges = db.badges_for_wallet(&wallet).await?;

    header(&format!("STATS {}", wallet));
    println!("  Markets Joined:  {}", stats.markets_joined);
    println!("  Wins:            {}", stats.wins);
    println!("  Win Rate:        {}%", stats.win_rate);
    println!("  Total Earnings:  {}", stats.total_earnings);

    if !badges.is_empty() {
        let names: Vec<&str> = badges.iter().map(|b| b.badge_type.as_str()).collect();
        println!("  Badges:          {}", names.join(", ").yellow());
    }
    if let Some(conn) = db.get_connection(&wallet).await? {
        println!("  X Account:       @{}", conn.x_username);
    }
    println!();
    Ok(())
}

async fn show_leaderboard(config: &Config, limit: usize) -> Result<()> {
    header("LEADERBOARD");
    let db = Database::new(&config.database_path).await?;
    let entries = db.leaderboard(limit).await?;
    if entries.is_empty() {
        println!("No predictions yet.\n");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{:>3}. {}  earnings {:>6} | joined {:>3} | win rate {:>3}%",
            entry.rank, entry.wallet, entry.total_earnings, entry.markets_joined, entry.win_rate
        );
    }
    println!();
    Ok(())
}

async fn list_proposals(config: &Config, status: Option<&str>) -> Result<()> {
    let filter = match status {
        Some(s) => Some(
            ProposalStatus::parse(s).ok_or_else(|| anyhow::anyhow!("Unknown proposal status: {}", s))?,
        ),
        None => None,
    };

    header("PROPOSALS");
    let db = Database::new(&config.database_path).await?;
    let proposals = db.list_proposals(filter).await?;
    if proposals.is_empty() {
        println!("No proposals found.\n");
        return Ok(());
    }

    for (i, p) in proposals.iter().enumerate() {
        println!(
            "{}. \"{}\" [{}] {} votes",
            i + 1,
            p.title,
            p.status.as_str(),
            p.votes
        );
        if let Some(market_id) = &p.market_id {
            println!("   -> market {}", market_id);
        }
    }
    println!();
    Ok(())
}

async fn monitor_once(config: &Config) -> Result<()> {
    header("X MONITOR - SINGLE CYCLE");
    let db = Arc::new(Database::new(&config.database_path).await?);
    let monitor = XMonitor::new(
        db,
        Arc::new(XClient::new()),
        CredentialVault::new(config.credential_secret.clone()),
        Arc::new(SystemClock),
        &config.monitor,
    );

    match monitor.tick().await {
        CycleOutcome::Completed(report) => {
            println!("Records checked:  {}", report.records_checked);
            println!("Markets checked:  {}", report.markets_checked);
            println!("Markets skipped:  {}", report.markets_skipped);
            println!("Accounts fetched: {}", report.accounts_fetched);
            println!("Fetch errors:     {}", report.fetch_errors);
            if report.rate_limited {
                println!("{}", "Rate limited by X; cycle aborted".yellow());
            }
            if report.resolved_markets.is_empty() {
                println!("No markets resolved.");
            } else {
                for id in &report.resolved_markets {
                    println!("{} {}", "Resolved".green().bold(), id);
                }
            }
        }
        CycleOutcome::Cooldown { until } => {
            println!("{}", format!("Rate-limit cooldown until {}", until).yellow());
        }
        CycleOutcome::AlreadyRunning => println!("A cycle is already running."),
        CycleOutcome::Failed(e) => println!("{}", format!("Cycle failed: {}", e).red()),
    }
    println!();
    Ok(())
}

async fn draft(config: &Config, text: &str) -> Result<()> {
    let drafter = MarketDrafter::from_config(&config.ai);
    let draft = drafter.draft(text, Utc::now()).await;

    header("MARKET DRAFT");
    println!("Title:       {}", draft.title.bold());
    println!("Description: {}", draft.description);
    println!("Category:    {}", draft.category.as_str());
    println!("Tags:        {}", draft.tags.join(", "));
    println!("Ends:        {}", draft.suggested_end_date.to_rfc3339());
    println!("Resolution:  {}", draft.resolution_method);
    println!("Options:     {}", draft.options.join(" / "));
    println!();
    Ok(())
}
