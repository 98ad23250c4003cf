use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use updraft_core::{
    CacheStore, ClientConfig, LogSink, SystemClock, UpdateCheckResult, UpdateClient, UpdateError,
};
use updraft_platform::AppPaths;

use crate::error::CliError;
use crate::logging::FileLogSink;
use crate::units::UnitsFile;
use crate::{Cli, Command};

pub async fn run(cli: &Cli, paths: &AppPaths) -> Result<ExitCode, CliError> {
    Ok(if execute(cli, paths).await? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Run the command for every selected unit. A failing unit is reported and
/// the rest still run; the shared cache is persisted afterwards either way.
async fn execute(cli: &Cli, paths: &AppPaths) -> Result<bool, CliError> {
    let units_path = cli.config.clone().unwrap_or_else(|| paths.units_file());

    if let Command::Add {
        server,
        unit_id,
        current_version,
        install_dir,
        api_key,
    } = &cli.command
    {
        let mut config = ClientConfig::new(
            server.as_str(),
            unit_id.as_str(),
            current_version.as_str(),
            install_dir.as_path(),
        );
        if let Some(api_key) = api_key {
            config = config.with_api_key(api_key.as_str());
        }
        add_unit(&units_path, config)?;
        return Ok(true);
    }

    let units = UnitsFile::load(&units_path)?;
    let configs = units.select(cli.unit.as_deref())?;

    let cache_file = paths.cache_file();
    let cache = Arc::new(CacheStore::load_from_path(
        &cache_file,
        Arc::new(SystemClock),
    ));

    let logs = Arc::new(FileLogSink::new(paths.unit_logs_dir()));

    let mut all_ok = true;
    for config in configs {
        let unit_id = config.unit_id.clone();
        let outcome = match build_client(config, paths, &cache, &logs) {
            Ok(client) => run_for_unit(&cli.command, &client, &logs).await,
            Err(error) => Err(error.into()),
        };
        match outcome {
            Ok(ok) => all_ok &= ok,
            Err(error) => {
                log::error!("[{unit_id}] {error}");
                println!("{unit_id}: {error}");
                all_ok = false;
            }
        }
    }

    if let Err(error) = cache.save_to_path(&cache_file) {
        log::warn!("Failed to persist cache to {}: {error}", cache_file.display());
    }

    Ok(all_ok)
}

fn build_client(
    mut config: ClientConfig,
    paths: &AppPaths,
    cache: &Arc<CacheStore>,
    logs: &Arc<FileLogSink>,
) -> Result<UpdateClient, UpdateError> {
    if config.backup_dir.is_none() {
        config.backup_dir = Some(paths.backups_dir());
    }
    UpdateClient::builder(config)
        .cache(cache.clone())
        .log_sink(logs.clone() as Arc<dyn LogSink>)
        .build()
}

fn add_unit(units_path: &Path, config: ClientConfig) -> Result<(), CliError> {
    config.validate().map_err(UpdateError::from)?;

    let mut units = if units_path.exists() {
        match UnitsFile::load(units_path) {
            Ok(units) => units,
            Err(CliError::NoUnits(_)) => UnitsFile::default(),
            Err(error) => return Err(error),
        }
    } else {
        UnitsFile::default()
    };

    let unit_id = config.unit_id.clone();
    units.units.retain(|unit| unit.unit_id != unit_id);
    units.units.push(config);
    units.save(units_path)?;

    println!("Added unit '{unit_id}' to {}", units_path.display());
    Ok(())
}

/// Run `command` for one unit, printing the outcome. Returns whether it
/// succeeded.
async fn run_for_unit(
    command: &Command,
    client: &UpdateClient,
    logs: &FileLogSink,
) -> Result<bool, CliError> {
    let unit = client.unit_id();
    match command {
        Command::Check => Ok(print_check(unit, &client.check_for_updates().await)),
        Command::Info => match client.fetch_plugin_information(unit).await {
            Ok(metadata) => {
                println!("{}", serde_json::to_string_pretty(&metadata)?);
                Ok(true)
            }
            Err(error) => Ok(print_error(unit, &error)),
        },
        Command::Connect => {
            let result = client.test_server_connection().await;
            println!(
                "{unit}: {} ({} ms)",
                result.message, result.elapsed_ms
            );
            Ok(result.connected)
        }
        Command::Health => {
            let Some(report) = client.check_system_health().await else {
                println!("{unit}: health monitoring is disabled");
                return Ok(true);
            };
            println!("{unit}: {:?}", report.status());
            for check in &report.checks {
                let mark = if check.passed { "ok" } else { "FAIL" };
                println!("  [{mark}] {}: {}", check.name, check.message);
            }
            Ok(report.is_healthy())
        }
        Command::Status => {
            match client.get_last_status() {
                Some(status) => println!(
                    "{unit}: {:?} at {}: {}",
                    status.status,
                    status.timestamp.to_rfc3339(),
                    status.message
                ),
                None => println!("{unit}: no recent status"),
            }
            Ok(true)
        }
        Command::Prepare => prepare(client).await,
        Command::Restore { archive } => restore(client, archive.as_deref()).await,
        Command::Backups => {
            let backups = match client.list_backups() {
                Ok(backups) => backups,
                Err(error) => return Ok(print_error(unit, &error)),
            };
            if backups.is_empty() {
                println!("{unit}: no backups");
            }
            for backup in backups {
                println!(
                    "{unit}: {} ({} bytes, {})",
                    backup.path.display(),
                    backup.size,
                    backup.created.to_rfc3339()
                );
            }
            Ok(true)
        }
        Command::Log { limit } => {
            let entries = logs.entries(unit);
            if entries.is_empty() {
                println!("{unit}: no recorded activity");
            }
            for entry in entries.iter().skip(entries.len().saturating_sub(*limit)) {
                let context: String = entry
                    .context
                    .iter()
                    .map(|(key, value)| format!(" {key}={value}"))
                    .collect();
                println!(
                    "{unit}: {} {:?} {}{context}",
                    entry.timestamp.to_rfc3339(),
                    entry.level,
                    entry.message
                );
            }
            Ok(true)
        }
        Command::Add { .. } => Ok(true),
    }
}

async fn prepare(client: &UpdateClient) -> Result<bool, CliError> {
    let unit = client.unit_id();
    let result = client.check_for_updates().await;
    let Some(update) = result.available() else {
        return Ok(print_check(unit, &result));
    };

    match client.prepare_update(update).await {
        Ok(prepared) => {
            println!(
                "{unit}: {} ready from {}",
                prepared.metadata.version, prepared.download_url
            );
            match &prepared.checksum {
                Some(checksum) => println!("  sha256 {checksum}"),
                None => println!("  package verification disabled"),
            }
            println!("  backup {}", prepared.backup_path.display());
            Ok(true)
        }
        Err(error) => Ok(print_error(unit, &error)),
    }
}

async fn restore(client: &UpdateClient, archive: Option<&Path>) -> Result<bool, CliError> {
    let unit = client.unit_id();
    let archive: PathBuf = match archive {
        Some(archive) => archive.to_path_buf(),
        None => client
            .list_backups()?
            .into_iter()
            .next()
            .map(|backup| backup.path)
            .ok_or_else(|| CliError::NoBackups(unit.to_string()))?,
    };

    match client.restore_backup(&archive).await {
        Ok(files) => {
            println!("{unit}: restored {files} files from {}", archive.display());
            Ok(true)
        }
        Err(error) => Ok(print_error(unit, &error)),
    }
}

fn print_check(unit: &str, result: &UpdateCheckResult) -> bool {
    match result {
        UpdateCheckResult::UpToDate {
            current_version,
            latest_version,
        } => {
            println!("{unit}: up to date ({current_version}, server offers {latest_version})");
            true
        }
        UpdateCheckResult::UpdateAvailable(update) => {
            println!(
                "{unit}: update available {} -> {}",
                update.current_version, update.metadata.version
            );
            true
        }
        UpdateCheckResult::Failed(error) => print_error(unit, error),
    }
}

fn print_error(unit: &str, error: &UpdateError) -> bool {
    println!("{unit}: {:?} error: {error}", error.kind());
    false
}
