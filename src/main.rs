use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use sealpost::config::{load_config, Cli, Command, Config, ListFilter, SignerChoice};
use sealpost::daemon_signer::DaemonSigner;
use sealpost::event::{now_secs, Keys};
use sealpost::read_state::{ConversationFilter, StaticFollowList, StaticMuteList};
use sealpost::relay_transport::WebSocketTransport;
use sealpost::service::MessagingService;
use sealpost::signer::{LocalKeySigner, Signer};
use sealpost::storage::{db_path, Message};
use sealpost::sync::SyncEvent;
use sealpost::{logging, tlog};

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn open_signer(choice: &SignerChoice) -> Result<Arc<dyn Signer>, Box<dyn Error>> {
    match choice {
        SignerChoice::SecretKey(secret) => Ok(Arc::new(LocalKeySigner::from_secret(secret)?)),
        SignerChoice::Daemon(socket) => Ok(Arc::new(DaemonSigner::connect(socket).await?)),
        SignerChoice::None => Err(
            "no identity: pass --secret-key, set SEALPOST_SECRET_KEY, or use --signer-socket"
                .into(),
        ),
    }
}

fn print_message(message: &Message) {
    let direction = if message.is_mine { "->" } else { "<-" };
    println!(
        "[{}] {direction} {} {}",
        message.created_at,
        logging::pubkey(&message.conversation_with),
        message.content
    );
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = Config::from_cli_and_env(&cli);
    logging::set_verbose(config.verbose);

    if let Command::Keygen = cli.command {
        let keys = Keys::generate();
        println!("public key: {}", keys.public_key().to_hex());
        println!("secret key: {}", keys.secret_key().to_secret_hex());
        return Ok(());
    }

    let settings = load_config(&config.data_dir)?;
    let service = MessagingService::init(
        &settings,
        &db_path(&config.data_dir),
        Arc::new(WebSocketTransport::new()),
        Arc::new(StaticMuteList::new(settings.muted.clone())),
        Arc::new(StaticFollowList::new(settings.followed.clone())),
    )?;

    match cli.command {
        Command::Keygen => {}
        Command::Whoami => {
            let signer = open_signer(&config.signer).await?;
            println!("{}", signer.public_key().to_hex());
        }
        Command::Send {
            recipient,
            message,
            reply_to,
        } => {
            let signer = open_signer(&config.signer).await?;
            service.start(signer).await?;
            let receipt = service.send(&recipient, &message, reply_to.as_deref()).await;
            service.stop().await;
            let receipt = receipt?;
            println!("sent {}", receipt.message.id);
            if !receipt.self_copy.is_completed() {
                println!("warning: the copy for your other devices was not published");
            }
        }
        Command::Sync => {
            let signer = open_signer(&config.signer).await?;
            service.start(signer).await?;
            service.stop().await;
            let unread = service.read_state().unread_count().await?;
            println!("synced; {unread} unread");
        }
        Command::Listen => {
            let signer = open_signer(&config.signer).await?;
            let mut events = service.subscribe();
            service.start(signer).await?;
            tlog!("listening since {}", now_secs());
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SyncEvent::MessageReceived(message)) => {
                            if !service.read_state().is_muted(&message.conversation_with).await {
                                print_message(&message);
                            }
                        }
                        Ok(SyncEvent::BackfillComplete { .. }) => {}
                        Err(RecvError::Lagged(missed)) => tlog!("listen: skipped {missed} event(s)"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            service.stop().await;
        }
        Command::Conversations {
            filter,
            limit,
            offset,
        } => {
            let filter = match filter {
                ListFilter::Known => ConversationFilter::Known,
                ListFilter::Unknown => ConversationFilter::Unknown,
                ListFilter::All => ConversationFilter::All,
            };
            let conversations = service
                .read_state()
                .conversations_filtered(filter, limit, offset)
                .await?;
            for conv in conversations {
                println!(
                    "{} unread={} last={} {}",
                    conv.partner, conv.unread_count, conv.last_message_at, conv.last_message_preview
                );
            }
        }
        Command::Messages {
            partner,
            limit,
            before,
        } => {
            for message in service.store().get_messages(&partner, limit, before)? {
                print_message(&message);
            }
        }
        Command::Read { partner } => {
            if !service.store().mark_as_read(&partner)? {
                println!("no conversation with {partner}");
            }
        }
        Command::ReadAll => {
            let changed = service.store().mark_all_as_read()?;
            println!("marked {changed} conversation(s) read");
        }
        Command::UnreadAll => {
            let changed = service.store().mark_all_as_unread()?;
            println!("marked {changed} conversation(s) unread");
        }
        Command::Unread => {
            let counts = service.read_state().unread_counts_split().await?;
            println!(
                "total={} known={} unknown={}",
                counts.total, counts.known, counts.unknown
            );
        }
        Command::Clear => {
            service.clear().await?;
            println!("local messages deleted");
        }
    }
    Ok(())
}
