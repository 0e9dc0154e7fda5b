//! Prints the active account's folder listing, optionally following sync.
//!
//! Usage:
//!   unimail
//!   unimail --folder archive
//!   unimail --watch --debug
//!   unimail --account work --search "invoice"

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tokio::sync::watch;

use unimail::auth::StaticSession;
use unimail::client::MailClient;
use unimail::config::{self, Config};
use unimail::driver::MailDriver;
use unimail::events::StateEvent;
use unimail::model::{Folder, Thread, ViewKey};
use unimail::{logging, provider};

struct Args {
    debug: bool,
    watch: bool,
    folder: Folder,
    account: Option<String>,
    search: Option<String>,
}

fn parse_args() -> Result<Option<Args>> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(None);
    }

    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let folder = match value_of("--folder") {
        Some(name) => Folder::parse(&name).with_context(|| {
            format!("Unknown folder '{name}' (inbox, archive, spam, bin, sent, drafts)")
        })?,
        None => Folder::Inbox,
    };

    Ok(Some(Args {
        debug: args.iter().any(|a| a == "--debug"),
        watch: args.iter().any(|a| a == "--watch"),
        folder,
        account: value_of("--account"),
        search: value_of("--search"),
    }))
}

fn print_usage() {
    println!("Usage: unimail [--folder <name>] [--search <query>] [--account <id>] [--watch] [--debug]");
    println!();
    println!("  --folder   inbox, archive, spam, bin, sent or drafts (default inbox)");
    println!("  --search   provider search query within the folder");
    println!("  --account  account id from config.toml (default: active_account)");
    println!("  --watch    keep running and print changes as they sync");
    println!("  --debug    write debug logs to ~/.config/unimail/debug.log");
}

fn print_thread(thread: &Thread) {
    let mut flags = String::new();
    flags.push(if thread.unread { '*' } else { ' ' });
    flags.push(if thread.starred { 's' } else { ' ' });
    flags.push(if thread.important { '!' } else { ' ' });

    println!(
        "{} {} {:<28.28} {:<50.50} {}",
        flags,
        thread.last_activity.format("%Y-%m-%d %H:%M"),
        thread.from,
        thread.subject,
        thread.labels.join(",")
    );
}

fn print_view(client: &MailClient, view: &ViewKey) {
    let threads = client.threads(view);
    println!("-- {} ({} thread(s)) --", view.folder, threads.len());
    for thread in &threads {
        print_thread(thread);
    }
}

async fn build_client(config: &Config, account_id: &str) -> Result<MailClient> {
    let account = config
        .account(account_id)
        .with_context(|| format!("No account '{account_id}' in config.toml"))?;

    let session = Arc::new(StaticSession::from_config(config));
    session.switch_to(account_id);

    let driver = MailDriver::new(session, Arc::new(config.clone()), config.retry.clone());
    let adapter = provider::connect(account).await?;
    driver.connect(account.connection()?, adapter)?;

    Ok(MailClient::new(Arc::new(driver), config.sync.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    logging::init(args.debug)?;

    if !config::has_config() {
        eprintln!(
            "Error: No configuration found.\n\
             Please create {:?} with at least one account, e.g.\n\n\
             active_account = \"personal\"\n\n\
             [[accounts]]\n\
             id = \"personal\"\n\
             provider = \"gmail\"\n\
             email = \"you@gmail.com\"\n\n\
             Gmail accounts also need OAuth client credentials at {:?}.",
            config::config_path()?,
            config::client_secret_path()?
        );
        std::process::exit(1);
    }

    let config = config::load_config()?;
    let account_id = args
        .account
        .clone()
        .or_else(|| config.active().map(|a| a.id.clone()))
        .context("No active_account in config.toml; pass --account <id>")?;

    let client = build_client(&config, &account_id).await?;
    let view = ViewKey {
        folder: args.folder,
        query: args.search.clone(),
    };

    client
        .list_threads(view.folder, view.query.as_deref(), None, config.sync.page_size)
        .await?;
    if let Err(e) = client.refresh_labels().await {
        eprintln!("Warning: could not load labels: {e}");
    }
    print_view(&client, &view);

    if !args.watch {
        return Ok(());
    }

    let mut events = client.subscribe();
    let (stop_tx, stop_rx) = watch::channel(false);
    let sync = client.spawn_sync(None, stop_rx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(StateEvent::ViewChanged(changed)) if changed == view => print_view(&client, &view),
                Ok(StateEvent::MutationFailed { kind, error, .. }) => {
                    eprintln!("{kind} failed: {error}");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => print_view(&client, &view),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = stop_tx.send(true);
    sync.await.context("Sync task failed")?;
    Ok(())
}
