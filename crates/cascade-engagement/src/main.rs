use anyhow::Context;
use cascade_engagement::{
    BreakdownRow, DashboardSnapshot, EngagementPipeline, GeneratorConfig, IngestStats, MemberQuery,
    MemberSummary, PipelineConfig, SyntheticData,
};
use cascade_kernel::{FixedClock, RefreshRecord, RefreshStatus};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cascade=info,cascade_engagement=info,cascade_kernel=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_arg = Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("Pipeline configuration file (TOML)");

    let cli = Command::new("cascade")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Incremental member engagement pipeline")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("simulate")
                .about("Run the pipeline over deterministic synthetic data")
                .arg(
                    Arg::new("members")
                        .long("members")
                        .default_value("50")
                        .value_parser(value_parser!(usize))
                        .help("Number of members"),
                )
                .arg(
                    Arg::new("resources")
                        .long("resources")
                        .default_value("20")
                        .value_parser(value_parser!(usize))
                        .help("Number of catalog resources"),
                )
                .arg(
                    Arg::new("sessions")
                        .long("sessions")
                        .default_value("25")
                        .value_parser(value_parser!(usize))
                        .help("Sessions per ingest batch"),
                )
                .arg(
                    Arg::new("batches")
                        .long("batches")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Number of ingest batches"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("top")
                        .long("top")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Members to list"),
                )
                .arg(config_arg.clone())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("dag")
                .about("Print the tables in refresh order")
                .arg(config_arg),
        )
        .subcommand(Command::new("config").about("Print the default configuration"));

    let matches = cli.get_matches();
    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("dag", args)) => dag(args),
        Some(("config", _)) => {
            print!("{}", toml::to_string_pretty(&PipelineConfig::default())?);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn load_config(args: &ArgMatches) -> anyhow::Result<PipelineConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

#[derive(Serialize)]
struct SimulationOutput {
    dashboard: DashboardSnapshot,
    top_members: Vec<MemberSummary>,
    member_types: Vec<BreakdownRow>,
    regions: Vec<BreakdownRow>,
    ingest: IngestStats,
    history: Vec<RefreshRecord>,
    failures: Vec<RefreshRecord>,
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let generator = GeneratorConfig {
        seed: *args.get_one::<u64>("seed").unwrap_or(&42),
        members: *args.get_one::<usize>("members").unwrap_or(&50),
        resources: *args.get_one::<usize>("resources").unwrap_or(&20),
        sessions_per_batch: *args.get_one::<usize>("sessions").unwrap_or(&25),
        ..GeneratorConfig::default()
    };
    let batches = *args.get_one::<usize>("batches").unwrap_or(&10);
    let top = *args.get_one::<usize>("top").unwrap_or(&10);

    // Simulated time follows the generated events so interval refreshes line up with the data.
    let clock = FixedClock::new(generator.start);
    let pipeline = EngagementPipeline::new(config, Arc::new(clock.clone()))?;
    let mut data = SyntheticData::new(generator);

    pipeline.load_members(data.members().to_vec()).await?;
    pipeline.load_resources(data.resources().to_vec()).await?;
    pipeline.bootstrap().await?;

    for batch in 0..batches {
        let records = data.next_batch();
        let report = pipeline.ingest(&records).await?;
        tracing::info!(
            batch,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            total = report.total,
            "batch ingested"
        );
        clock.set(data.cursor());
        pipeline.tick().await?;
    }
    // Final refresh so the dashboard reflects every batch.
    pipeline.refresh(cascade_engagement::stages::ENGAGEMENT_DASHBOARD).await?;

    let output = SimulationOutput {
        dashboard: pipeline.dashboard()?,
        top_members: pipeline.members(&MemberQuery::top(top))?,
        member_types: pipeline.member_type_breakdown()?,
        regions: pipeline.region_breakdown()?,
        ingest: pipeline.ingest_stats(),
        history: pipeline.last_refreshes()?,
        failures: pipeline.failed_refreshes(),
    };

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text(&output);
    }
    Ok(())
}

fn print_text(output: &SimulationOutput) {
    let d = &output.dashboard;
    println!("Engagement Dashboard");
    println!("====================");
    println!("  Active members:          {}", d.active_members);
    println!("  Total sessions:          {}", d.total_sessions);
    println!("  Engagement hours:        {}", d.total_engagement_hours);
    println!("  Resource views:          {}", d.total_resource_views);
    println!("  Avg minutes / member:    {}", d.avg_engagement_minutes_per_member);
    println!("  Avg sessions / member:   {}", d.avg_sessions_per_member);
    println!(
        "  Tiers:                   {} premium, {} registered, {} free",
        d.premium_members, d.registered_members, d.free_members
    );
    println!("  Top topic:               {}", d.top_topic.as_deref().unwrap_or("-"));
    println!("  Top content type:        {}", d.top_content_type.as_deref().unwrap_or("-"));
    println!("  Generated at:            {}", d.report_generated_at);
    println!();

    println!("Top Members");
    println!("-----------");
    for m in &output.top_members {
        println!(
            "  {:<20} {:<10} {:<10} {:>3} sessions {:>7} min  {}",
            m.member_name,
            m.member_type,
            m.region,
            m.total_sessions,
            m.engagement_minutes(),
            m.favorite_topic.as_deref().unwrap_or("-"),
        );
    }
    println!();

    println!("Members by Type");
    for row in &output.member_types {
        println!("  {:<12} {}", row.key, row.count);
    }
    println!("Members by Region");
    for row in &output.regions {
        println!("  {:<12} {}", row.key, row.count);
    }
    println!();

    println!(
        "Ingest: {} accepted, {} rejected",
        output.ingest.accepted, output.ingest.rejected
    );
    for (reason, count) in &output.ingest.rejected_by_reason {
        println!("  {reason}: {count}");
    }
    println!();

    println!("Last Refresh per Table");
    for record in &output.history {
        let status = if record.status.is_success() { "ok" } else { "FAILED" };
        println!(
            "  {:<28} {:<16} {:<6} {:>6} rows  {}  {}ms",
            record.table_name,
            record.trigger,
            status,
            record.rows,
            record.version,
            record.duration_ms
        );
    }
    if !output.failures.is_empty() {
        println!();
        println!("Failed Refreshes");
        for record in &output.failures {
            if let RefreshStatus::Failed { reason } = &record.status {
                println!("  {:<28} {:<16} {reason}", record.table_name, record.trigger);
            }
        }
    }
}

fn dag(args: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let pipeline = EngagementPipeline::with_system_clock(config)?;
    println!("Refresh order");
    for (position, table) in pipeline.describe()?.iter().enumerate() {
        let policy = table
            .policy
            .map_or_else(|| "source".to_string(), |p| p.to_string());
        let upstreams = if table.upstreams.is_empty() {
            "-".to_string()
        } else {
            table.upstreams.join(", ")
        };
        let clock = if table.time_dependent { " (time-dependent)" } else { "" };
        println!(
            "  {:>2}. {:<28} {:<12} <- {}{}",
            position + 1,
            table.name,
            policy,
            upstreams,
            clock
        );
    }
    Ok(())
}
