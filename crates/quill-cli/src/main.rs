//! # Quill CLI
//!
//! Command-line utilities for inspecting tokens and snapshots.

use anyhow::{bail, Context, Result};
use quill_core::Role;
use quill_proto::{decode_token, verify_token, DocumentSnapshot, Ed25519Signer, RoleKeys};
use serde_json::json;
use std::env;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "decode" => {
            let Some(token) = args.get(2) else {
                eprintln!("Usage: quill decode <token>");
                std::process::exit(1);
            };
            let decoded = decode_token(token).context("Failed to decode token")?;
            let out = json!({
                "header": decoded.header,
                "payload": decoded.payload,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        "inspect" => {
            let Some(path) = args.get(2) else {
                eprintln!("Usage: quill inspect <snapshot.json>");
                std::process::exit(1);
            };
            inspect(path).await?;
        }
        "keygen" => {
            let keys = RoleKeys::generate(&Ed25519Signer).context("Failed to generate keys")?;
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Print one line per op, checking each signature against the key of the
/// role named in its `kid`.
async fn inspect(path: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    let snapshot = DocumentSnapshot::from_json(&raw).context("Failed to parse snapshot")?;

    println!("doc {} ({} ops)", snapshot.doc_id, snapshot.ops.len());

    let mut invalid = 0usize;
    for (i, op) in snapshot.ops.iter().enumerate() {
        let decoded = match decode_token(&op.token) {
            Ok(decoded) => decoded,
            Err(e) => {
                invalid += 1;
                println!("{i:>4}  <undecodable: {e}>");
                continue;
            }
        };
        let role = decoded
            .header
            .kid
            .as_deref()
            .and_then(|kid| kid.rsplit_once(':'))
            .and_then(|(_, role)| role.parse::<Role>().ok());
        let key = match role {
            Some(Role::Owner) => Some(&snapshot.role_keys.owner),
            Some(Role::Manager) => Some(&snapshot.role_keys.manager),
            Some(Role::Editor) => Some(&snapshot.role_keys.editor),
            _ => None,
        };
        let verdict = match key {
            Some(key) => match verify_token(&Ed25519Signer, key, &op.token).await {
                Ok(_) => "ok",
                Err(_) => "bad-signature",
            },
            None => "unknown-key",
        };
        if verdict != "ok" {
            invalid += 1;
        }

        let payload = &decoded.payload;
        println!(
            "{i:>4}  {verdict:<13} {:<16} {:<12} {:<10} {}",
            payload.kind.to_string(),
            payload.field.as_deref().unwrap_or("-"),
            payload.iss,
            payload.patch
        );
    }

    if invalid > 0 {
        bail!("{invalid} of {} ops failed to verify", snapshot.ops.len());
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"Quill CLI

USAGE:
    quill <COMMAND> [OPTIONS]

COMMANDS:
    decode <token>            Print the header and payload of an op token
    inspect <snapshot.json>   List a snapshot's ops and check their signatures
    keygen                    Generate owner, manager and editor key pairs
    help                      Show this help message

EXAMPLES:
    quill keygen > keys.json
    quill inspect snapshot.json
"#
    );
}
