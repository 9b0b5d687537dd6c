use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loadsync_core::LoadoutId;
use loadsyncd::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Apply(LoadoutId),
    Ingest(LoadoutId),
    Create(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let mode = match args.next().as_deref() {
        Some("--apply") => CliMode::Apply(parse_loadout_id(args.next())?),
        Some("--ingest") => CliMode::Ingest(parse_loadout_id(args.next())?),
        Some("--create") => {
            let name = args.next().filter(|name| !name.is_empty());
            CliMode::Create(name.ok_or_else(|| anyhow::anyhow!("--create needs a name"))?)
        }
        Some("--help") | Some("-h") | None => CliMode::Help,
        Some(other) => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn parse_loadout_id(arg: Option<String>) -> anyhow::Result<LoadoutId> {
    let raw = arg.ok_or_else(|| anyhow::anyhow!("expected a loadout id"))?;
    let id = raw
        .parse::<u64>()
        .map_err(|_| anyhow::anyhow!("invalid loadout id: {raw}"))?;
    Ok(LoadoutId(id))
}

fn print_usage() {
    println!("Usage: loadsyncd [--apply ID | --ingest ID | --create NAME]");
    println!("  --apply ID     Push loadout ID onto disk");
    println!("  --ingest ID    Fold external disk changes into loadout ID");
    println!("  --create NAME  Adopt the current install as a new loadout");
    println!();
    println!("Configuration comes from the environment:");
    println!("  LOADSYNC_LOCATIONS  location=/root pairs, comma separated (required)");
    println!("  LOADSYNC_IGNORE     location:path entries, trailing / for directories");
    println!("  LOADSYNC_DB         database path");
    println!("  LOADSYNC_BACKUP_DIR archive directory");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mode = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_usage();
            return Ok(());
        }
        mode => mode,
    };

    let engine = EngineConfig::from_env()?.bootstrap().await?;
    let cancel = CancellationToken::new();

    let summary = match mode {
        CliMode::Apply(id) => engine.apply(id, cancel).await?,
        CliMode::Ingest(id) => engine.ingest(id, cancel).await?,
        CliMode::Create(name) => {
            let (loadout, summary) = engine.create_loadout(&name, cancel).await?;
            eprintln!("[loadsyncd] created loadout {} ({})", loadout.id, loadout.name);
            summary
        }
        CliMode::Help => unreachable!("handled above"),
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
