use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::{Args, Parser, Subcommand};
use gpuwatch_api::app;
use gpuwatch_api::types::WatchRequest;
use gpuwatch_backend::mock::MockTelemetry;
use gpuwatch_backend::TelemetrySource;
use gpuwatch_cli::client::Client;
use gpuwatch_common::config::GpuWatchConfig;
use gpuwatch_common::FieldId;
use gpuwatch_core::{Daemon, FieldGroupId, GroupId, GroupKind, Handle, JobInfo};
use opentelemetry_otlp::WithExportConfig;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gpuwatch", version, about = "GPU telemetry daemon and client")]
struct Cli {
    /// Daemon address for client commands
    #[arg(long, global = true, default_value = "http://127.0.0.1:50051")]
    server: String,
    /// Reuse an open session instead of opening a temporary one
    #[arg(long, global = true)]
    handle: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon
    Serve,
    /// Open or close a session that outlives one command
    #[command(subcommand)]
    Session(SessionCmd),
    /// List devices
    Discovery,
    #[command(subcommand)]
    Group(GroupCmd),
    #[command(subcommand)]
    Fieldgroup(FieldGroupCmd),
    /// Watch fields and print their latest values
    Dmon(DmonArgs),
    /// Job statistics
    #[command(subcommand)]
    Stats(StatsCmd),
    Version,
}

#[derive(Subcommand, Debug)]
enum SessionCmd {
    Open,
    Close,
}

#[derive(Subcommand, Debug)]
enum GroupCmd {
    Create {
        name: String,
        /// Start with every device
        #[arg(long)]
        default: bool,
    },
    Add { group: u32, device: u32 },
    List,
    Info { group: u32 },
    Delete { group: u32 },
}

#[derive(Subcommand, Debug)]
enum FieldGroupCmd {
    /// Fields by name or number, comma separated
    Create { name: String, fields: String },
    List,
    Info { id: u32 },
    Delete { id: u32 },
}

#[derive(Args, Debug)]
struct DmonArgs {
    /// Fields by name or number, comma separated
    #[arg(short, long, default_value = "GPU_TEMP,POWER_USAGE,GPU_UTIL")]
    fields: String,
    /// Devices to watch; every device when empty
    #[arg(short = 'i', long, value_delimiter = ',')]
    devices: Vec<u32>,
    #[arg(short = 'd', long, default_value_t = 1000)]
    interval_ms: u64,
    /// Rows to print before exiting
    #[arg(short, long, default_value_t = 10)]
    count: u32,
}

#[derive(Subcommand, Debug)]
enum StatsCmd {
    Start {
        job_id: String,
        #[arg(short, long)]
        group: u32,
        #[arg(long, default_value_t = 3600)]
        keep_secs: u64,
    },
    Stop { job_id: String },
    Get { job_id: String },
    Remove { job_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Session(cmd) => session(&cli.server, cmd, cli.handle).await,
        command => {
            let client = Client::new(cli.server.as_str(), Duration::from_secs(10))?;
            let (handle, temporary) = match cli.handle {
                Some(h) => (Handle(h), false),
                None => (client.connect().await.context("opening session")?, true),
            };
            let outcome = run(&client, handle, command).await;
            if temporary {
                client.disconnect(handle).await.context("closing session")?;
            }
            outcome
        }
    }
}

fn telemetry_source(config: &GpuWatchConfig) -> Arc<dyn TelemetrySource> {
    #[cfg(feature = "nvidia")]
    {
        match gpuwatch_obs::nvml::NvmlTelemetry::init() {
            Ok(nvml) => return Arc::new(nvml),
            Err(e) => tracing::warn!(error = %e, "nvml unavailable, using mock devices"),
        }
    }
    Arc::new(MockTelemetry::new(config.mock_devices))
}

async fn serve() -> anyhow::Result<()> {
    let config = GpuWatchConfig::load();
    let addr = config.listen_addr.clone();
    let daemon = Daemon::start(config.clone(), telemetry_source(&config))?;
    let app: Router = app(daemon.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!("listening on http://{}", addr);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    daemon.shutdown().await;
    Ok(())
}

async fn session(server: &str, cmd: SessionCmd, handle: Option<u64>) -> anyhow::Result<()> {
    let client = Client::new(server, Duration::from_secs(10))?;
    match cmd {
        SessionCmd::Open => println!("{}", client.connect().await?),
        SessionCmd::Close => {
            let handle = handle.context("--handle is required")?;
            client.disconnect(Handle(handle)).await?;
        }
    }
    Ok(())
}

fn parse_fields(list: &str) -> anyhow::Result<Vec<FieldId>> {
    list.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).map(|s| Ok(s.parse::<FieldId>()?)).collect()
}

async fn run(client: &Client, h: Handle, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Discovery => {
            let devices = client.list_devices(h).await?;
            println!("{} device(s) found", devices.len());
            for index in devices {
                let info = client.device_attributes(h, index).await?;
                println!("{:>3}  {}", info.index, info.name);
            }
        }
        Commands::Group(cmd) => match cmd {
            GroupCmd::Create { name, default } => {
                let kind = if default { GroupKind::Default } else { GroupKind::Empty };
                println!("created group {}", client.create_group(h, kind, &name).await?);
            }
            GroupCmd::Add { group, device } => client.add_device(h, GroupId(group), device).await?,
            GroupCmd::List => {
                for id in client.list_groups(h).await? {
                    let g = client.group_info(h, id).await?;
                    println!("{:>3}  {:<24} {:?}", g.id, g.name, g.devices);
                }
            }
            GroupCmd::Info { group } => {
                let g = client.group_info(h, GroupId(group)).await?;
                println!("{}", serde_json::to_string_pretty(&g)?);
            }
            GroupCmd::Delete { group } => client.destroy_group(h, GroupId(group)).await?,
        },
        Commands::Fieldgroup(cmd) => match cmd {
            FieldGroupCmd::Create { name, fields } => {
                let fields = parse_fields(&fields)?;
                println!("created field group {}", client.create_field_group(h, &fields, &name).await?);
            }
            FieldGroupCmd::List => {
                for id in client.list_field_groups(h).await? {
                    let g = client.field_group_info(h, id).await?;
                    let names: Vec<&str> = g.fields.iter().map(|f| f.name()).collect();
                    println!("{:>3}  {:<24} {}", g.id, g.name, names.join(","));
                }
            }
            FieldGroupCmd::Info { id } => {
                let g = client.field_group_info(h, FieldGroupId(id)).await?;
                println!("{}", serde_json::to_string_pretty(&g)?);
            }
            FieldGroupCmd::Delete { id } => client.destroy_field_group(h, FieldGroupId(id)).await?,
        },
        Commands::Dmon(args) => dmon(client, h, args).await?,
        Commands::Stats(cmd) => match cmd {
            StatsCmd::Start { job_id, group, keep_secs } => {
                client.start_job(h, &job_id, GroupId(group), Duration::from_secs(keep_secs)).await?;
                println!("started job {job_id}");
            }
            StatsCmd::Stop { job_id } => print_job(&client.stop_job(h, &job_id).await?),
            StatsCmd::Get { job_id } => print_job(&client.job_info(h, &job_id).await?),
            StatsCmd::Remove { job_id } => client.remove_job(h, &job_id).await?,
        },
        Commands::Serve | Commands::Session(_) | Commands::Version => {}
    }
    Ok(())
}

async fn dmon(client: &Client, h: Handle, args: DmonArgs) -> anyhow::Result<()> {
    let fields = parse_fields(&args.fields)?;
    let group = if args.devices.is_empty() {
        client.create_group(h, GroupKind::Default, "dmon").await?
    } else {
        let group = client.create_group(h, GroupKind::Empty, "dmon").await?;
        for device in &args.devices {
            client.add_device(h, group, *device).await?;
        }
        group
    };
    let devices = client.group_info(h, group).await?.devices;
    let field_group = client.create_field_group(h, &fields, "dmon").await?;
    client
        .watch(
            h,
            WatchRequest {
                group_id: group,
                field_group_id: field_group,
                update_interval_ms: args.interval_ms,
                max_keep_age_ms: args.interval_ms * 10,
                max_keep_samples: 0,
            },
        )
        .await?;

    let header: Vec<String> = fields.iter().map(|f| format!("{:>16}", f.name())).collect();
    println!("{:>4}{}", "GPU", header.join(""));
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    ticker.tick().await;
    for _ in 0..args.count {
        ticker.tick().await;
        for &device in &devices {
            let mut row = format!("{device:>4}");
            for &field in &fields {
                let cell = match client.latest_value(h, device, field).await {
                    Ok(sample) => format!("{} {}", sample.value, field.unit()),
                    Err(_) => "N/A".to_string(),
                };
                row.push_str(&format!("{cell:>16}"));
            }
            println!("{row}");
        }
    }
    client.unwatch(h, group, field_group).await?;
    client.destroy_field_group(h, field_group).await?;
    client.destroy_group(h, group).await?;
    Ok(())
}

fn print_job(info: &JobInfo) {
    let state = if info.running { "running" } else { "stopped" };
    println!("job {} ({state}) on group {} with {} device(s)", info.job_id, info.group_id, info.num_devices);
    if let Some(j) = info.summary.energy_consumed {
        println!("energy consumed: {j:.1} J");
    }
    println!("{:<20} {:>12} {:>12} {:>12} {:>12} {:>8}", "FIELD", "MAX", "MIN", "AVG", "STDDEV", "SAMPLES");
    for (field, summary) in &info.summary.fields {
        match summary {
            Some(s) => println!(
                "{:<20} {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>8}",
                field.name(),
                s.max,
                s.min,
                s.average,
                s.std_dev,
                s.samples
            ),
            None => println!("{:<20} {:>12}", field.name(), "N/A"),
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn dmon_flags_parse() {
        let cli = Cli::try_parse_from(["gpuwatch", "dmon", "-i", "0,1", "-d", "250", "-c", "3", "-f", "GPU_TEMP"]).unwrap();
        let Commands::Dmon(args) = cli.command else { panic!("expected dmon") };
        assert_eq!(args.devices, vec![0, 1]);
        assert_eq!(args.interval_ms, 250);
        assert_eq!(args.count, 3);
        assert_eq!(args.fields, "GPU_TEMP");
    }
}
