//! # murmur
//!
//! Command-line front end for the delivery engine.
//!
//! ```text
//! murmur keygen
//! murmur send <pubkey-hex> <text>
//! murmur listen
//! murmur sync [seconds-back]
//! murmur status
//! ```
//!
//! Configuration comes from `MURMUR_*` environment variables; the identity
//! from `MURMUR_SECRET_KEY`.

use anyhow::{bail, Context};
use chrono::Utc;
use tracing::info;

use murmur_client::{init_tracing, Client, ClientConfig};
use murmur_shared::Identity;

const USAGE: &str = "usage: murmur <keygen | send <pubkey> <text> | listen | sync [seconds] | status>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        bail!(USAGE);
    };

    if command == "keygen" {
        let identity = Identity::generate();
        println!("secret: {}", identity.secret_hex());
        println!("pubkey: {}", identity.public_key().to_hex());
        return Ok(());
    }

    let config = ClientConfig::from_env();
    let secret = config
        .secret_key
        .clone()
        .context("MURMUR_SECRET_KEY is not set (run `murmur keygen`)")?;
    let identity = Identity::from_secret_hex(&secret).context("invalid MURMUR_SECRET_KEY")?;
    info!(pubkey = %identity.public_key().to_hex(), "Loaded identity");

    let client = Client::open(config, identity)?;
    client.wait_until_ready().await?;
    let engine = client.engine();

    match (command, &args[1..]) {
        ("send", [recipient, words @ ..]) if !words.is_empty() => {
            let receipt = engine.send_text(recipient, &words.join(" ")).await?;
            println!("{} {}", receipt.local_id, receipt.status);
            if let Some(kind) = receipt.error_kind {
                println!("{}", kind.user_message());
            }
        }
        ("listen", []) => {
            let mut incoming = engine.subscribe_incoming();
            println!("listening as {}", engine.public_key().to_hex());
            loop {
                tokio::select! {
                    message = incoming.recv() => match message {
                        Ok(m) => println!("[{}] {}: {}", m.timestamp.format("%H:%M:%S"), m.sender.short(), m.content),
                        Err(e) => bail!("incoming stream ended: {e}"),
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        ("sync", rest) => {
            let since = match rest {
                [] => None,
                [secs] => {
                    let secs: i64 = secs.parse().context("seconds must be a number")?;
                    Some(Utc::now() - chrono::Duration::seconds(secs))
                }
                _ => bail!(USAGE),
            };
            let count = engine.sync_missed_messages(since).await?;
            println!("{count} new messages");
        }
        ("status", []) => {
            let queue = engine.queue_status()?;
            println!("queued: {}", queue.total_queued);
            for relay in client.relay_health() {
                println!("{} {:?}", relay.url, relay.health);
            }
        }
        _ => bail!(USAGE),
    }

    client.shutdown();
    Ok(())
}
