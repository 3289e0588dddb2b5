//! Brokercat catalog CLI commands
//!
//! Operator and diagnostic commands over the catalog loader: list the
//! local catalog, force a verified refresh, inspect the cache, and check a
//! payload/signature pair offline.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::debug;

use brokercat_core::catalog::{self, BrokerRecord, CatalogLoader, RefreshOutcome};
use brokercat_core::trust::{self, TrustedKeySet};
use brokercat_core::CatalogConfig;

#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// List brokers from the local catalog (cache, else bundled)
    List {
        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Fetch, verify and cache the remote catalog
    Refresh {
        /// Give up after this many seconds
        #[clap(long)]
        deadline_secs: Option<u64>,

        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Show cache state and whether a refresh is due
    Status {
        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Verify a catalog payload against a signature file, offline
    Verify {
        /// Catalog payload (brokers.json)
        payload: PathBuf,

        /// Signature file (brokers.json.sig)
        signature: PathBuf,

        /// Trusted key as id=base64, repeatable; defaults to the builtin keys
        #[clap(long = "pubkey", value_name = "ID=BASE64")]
        pubkeys: Vec<String>,
    },

    /// Remove the cached catalog and refresh state
    ClearCache,
}

impl CatalogCommand {
    pub async fn execute(self, config_path: Option<&Path>) -> Result<()> {
        match self {
            CatalogCommand::List { json } => execute_list(&open_loader(config_path)?, json),
            CatalogCommand::Refresh {
                deadline_secs,
                json,
            } => execute_refresh(&open_loader(config_path)?, deadline_secs, json).await,
            CatalogCommand::Status { json } => execute_status(&open_loader(config_path)?, json),
            CatalogCommand::Verify {
                payload,
                signature,
                pubkeys,
            } => execute_verify(&payload, &signature, &pubkeys),
            CatalogCommand::ClearCache => execute_clear(&open_loader(config_path)?),
        }
    }
}

fn open_loader(config_path: Option<&Path>) -> Result<CatalogLoader> {
    let config = CatalogConfig::load(config_path)?;
    let loader =
        CatalogLoader::from_config(config).context("Failed to initialize catalog loader")?;
    debug!("Using {:?}", loader);
    Ok(loader)
}

#[derive(Tabled)]
struct BrokerRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Server")]
    server: String,
    #[tabled(rename = "Platform")]
    platform: String,
    #[tabled(rename = "Demo")]
    demo: String,
    #[tabled(rename = "Description")]
    description: String,
}

impl From<&BrokerRecord> for BrokerRow {
    fn from(record: &BrokerRecord) -> Self {
        let desc = record.short_description();
        let description = if desc.chars().count() > 50 {
            format!("{}...", desc.chars().take(47).collect::<String>())
        } else {
            desc.to_string()
        };

        BrokerRow {
            name: record.name.clone(),
            server: record.server.clone(),
            platform: record.platform.to_string(),
            demo: if record.demo { "yes" } else { "" }.to_string(),
            description,
        }
    }
}

fn print_brokers(records: &[BrokerRecord]) {
    let rows: Vec<BrokerRow> = records.iter().map(BrokerRow::from).collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string();
    println!("{table}");
}

fn execute_list(loader: &CatalogLoader, json_output: bool) -> Result<()> {
    let (tier, records) = loader.load_catalog_with_tier();

    if json_output {
        let output = serde_json::json!({
            "tier": tier,
            "brokers": records,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{} broker(s) from the {} catalog:\n", records.len(), tier);
        print_brokers(&records);
    }

    Ok(())
}

async fn execute_refresh(
    loader: &CatalogLoader,
    deadline_secs: Option<u64>,
    json_output: bool,
) -> Result<()> {
    let result = match deadline_secs {
        Some(secs) => {
            loader
                .fetch_and_verify_with_deadline(Duration::from_secs(secs))
                .await
        }
        None => loader.fetch_and_verify_detailed().await,
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if json_output {
                let output = serde_json::json!({
                    "status": if e.is_rejection() { "rejected" } else { "failed" },
                    "reason": e.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            return Err(anyhow!(e).context("Catalog refresh did not produce a trusted catalog"));
        }
    };

    if json_output {
        let output = match &outcome {
            RefreshOutcome::Updated {
                records,
                key_id,
                etag,
            } => serde_json::json!({
                "status": "updated",
                "keyId": key_id.as_str(),
                "etag": etag,
                "brokers": records.len(),
            }),
            RefreshOutcome::Unmodified { records } => serde_json::json!({
                "status": "unmodified",
                "brokers": records.len(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match &outcome {
        RefreshOutcome::Updated { key_id, etag, .. } => {
            println!(
                "✅ Catalog updated: {} broker(s), signed by '{}'",
                outcome.records().len(),
                key_id
            );
            if let Some(etag) = etag {
                println!("   ETag: {etag}");
            }
        }
        RefreshOutcome::Unmodified { records } => {
            println!("✅ Catalog unmodified: {} broker(s) cached", records.len());
        }
    }

    Ok(())
}

fn execute_status(loader: &CatalogLoader, json_output: bool) -> Result<()> {
    let status = loader.cache_status();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Cache directory: {}", status.dir.display());
    println!("Remote:          {}", loader.config().catalog_url());

    if status.present {
        let age = status
            .age_secs
            .map(format_age)
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "Cached catalog:  present, {} old{}",
            age,
            if status.expired { " (expired)" } else { "" }
        );
        if let Some(fetched_at) = status.fetched_at {
            println!("Fetched at:      {}", fetched_at.to_rfc3339());
        }
        if let Some(etag) = &status.etag {
            println!("ETag:            {etag}");
        }
    } else {
        println!("Cached catalog:  none");
    }

    match status.last_checked_at {
        Some(checked) => println!("Last check:      {}", checked.to_rfc3339()),
        None => println!("Last check:      never"),
    }
    println!(
        "Refresh due:     {}",
        if status.should_update { "yes" } else { "no" }
    );

    Ok(())
}

fn execute_clear(loader: &CatalogLoader) -> Result<()> {
    loader
        .store()
        .clear()
        .context("Failed to clear the catalog cache")?;
    println!("Cleared catalog cache in {}", loader.store().dir().display());
    Ok(())
}

fn execute_verify(payload_path: &Path, signature_path: &Path, pubkeys: &[String]) -> Result<()> {
    let payload = std::fs::read(payload_path)
        .with_context(|| format!("Failed to read {}", payload_path.display()))?;
    let signature = std::fs::read(signature_path)
        .with_context(|| format!("Failed to read {}", signature_path.display()))?;

    let keys = if pubkeys.is_empty() {
        TrustedKeySet::builtin()?
    } else {
        let pairs = pubkeys
            .iter()
            .map(|spec| {
                spec.split_once('=')
                    .ok_or_else(|| anyhow!("Invalid --pubkey '{spec}', expected ID=BASE64"))
            })
            .collect::<Result<Vec<_>>>()?;
        TrustedKeySet::from_base64(&pairs)?
    };

    let key_id = trust::verify(&payload, &signature, &keys)
        .context("Signature verification failed")?;
    println!("✅ Signature valid (key '{key_id}')");

    let records = catalog::parse(&payload).context("Catalog failed schema validation")?;
    println!("✅ Schema valid: {} broker(s)", records.len());

    Ok(())
}

fn format_age(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d {}h", s / 86_400, (s % 86_400) / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(5), "5s");
        assert_eq!(format_age(125), "2m");
        assert_eq!(format_age(7_200), "2h");
        assert_eq!(format_age(2 * 86_400 + 3 * 3600), "2d 3h");
    }

    #[test]
    fn test_broker_row_truncates_long_description() {
        let record = BrokerRecord {
            name: "Alpha".to_string(),
            server: "Alpha-Demo".to_string(),
            platform: brokercat_core::Platform::Mt4,
            web_terminal_url: "https://alpha.example".to_string(),
            logo: None,
            description: Some("é".repeat(80)),
            demo: true,
        };

        let row = BrokerRow::from(&record);
        assert_eq!(row.description.chars().count(), 50);
        assert!(row.description.ends_with("..."));
        assert_eq!(row.demo, "yes");
        assert_eq!(row.platform, "MT4");
    }
}
