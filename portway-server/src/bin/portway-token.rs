//! Token provisioning tool.
//!
//! Grants are written straight to the gateway's SQLite token store; the
//! plaintext token is printed once at issue time and never persisted.

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use portway_auth::TokenStore;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "portway-token", version, about = "Manage Portway access tokens")]
struct Cli {
    /// Path to the token database
    #[arg(long, default_value = "data/tokens.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a new token and print it
    Issue {
        /// Principal the token authenticates as
        #[arg(long)]
        username: String,

        /// CSV of endpoint scope patterns (default: everything)
        #[arg(long, default_value = "*")]
        scopes: String,

        /// CSV of environment patterns (default: everything)
        #[arg(long, default_value = "*")]
        environments: String,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,

        /// Expiry in days from now (omit for no expiry)
        #[arg(long)]
        expires_days: Option<i64>,
    },

    /// Revoke a token by id
    Revoke { id: i64 },

    /// List all grants
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let store = TokenStore::open(&cli.db).await?;

    match cli.command {
        Command::Issue {
            username,
            scopes,
            environments,
            description,
            expires_days,
        } => {
            let token = generate_token();
            let expires_at = expires_days.map(|days| Utc::now() + Duration::days(days));
            let id = store
                .insert(&username, &token, &scopes, &environments, &description, expires_at)
                .await?;
            println!("Issued token {id} for {username}");
            println!("  scopes:       {scopes}");
            println!("  environments: {environments}");
            match expires_at {
                Some(at) => println!("  expires:      {}", at.to_rfc3339()),
                None => println!("  expires:      never"),
            }
            println!();
            println!("  {token}");
            println!();
            println!("Store this token now; it cannot be recovered later.");
        }
        Command::Revoke { id } => {
            if store.revoke(id).await? {
                println!("Token {id} revoked");
            } else {
                println!("Token {id} not found or already revoked");
            }
        }
        Command::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No tokens");
                return Ok(());
            }
            println!("{:<5} {:<20} {:<24} {:<16} {:<10}", "id", "username", "scopes", "environments", "state");
            for record in records {
                let state = if record.revoked_at.is_some() {
                    "revoked"
                } else if !record.is_active(Utc::now()) {
                    "expired"
                } else {
                    "active"
                };
                println!(
                    "{:<5} {:<20} {:<24} {:<16} {:<10}",
                    record.id, record.username, record.allowed_scopes, record.allowed_environments, state
                );
            }
        }
    }

    Ok(())
}

/// 32 bytes of randomness, URL-safe base64 without padding.
fn generate_token() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
