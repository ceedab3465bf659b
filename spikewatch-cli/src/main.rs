use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "spikewatch-cli", about = "Query a running spikewatchd's read API")]
struct Args {
    /// Base URL of the spikewatchd read API.
    #[arg(long, env = "SPIKEWATCH_SERVER", default_value = "http://127.0.0.1:4099")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List recent confirmed spikes.
    Spikes {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one spike incident in full, including its RCA report.
    Spike { id: u64 },
    /// Show the most recently completed RCA report.
    LatestRca,
    /// Show the most recent normalized events.
    Events {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show the host CPU/RAM telemetry window.
    Telemetry {
        #[arg(long, default_value_t = 300)]
        seconds: u64,
    },
}

#[derive(Debug, Deserialize)]
struct SpikesResponse {
    spikes: Vec<SpikeIncident>,
}

#[derive(Debug, Deserialize)]
struct SpikeIncident {
    id: u64,
    detected_at: chrono::DateTime<chrono::Utc>,
    cpu_at_confirm: f64,
    ram_at_confirm: f64,
    ranked_suspects: Vec<Suspect>,
    rca: Option<RcaReport>,
}

#[derive(Debug, Deserialize)]
struct Suspect {
    pid: i32,
    name: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct RcaReport {
    cause_summary: String,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct LatestRcaResponse {
    latest_rca: Option<RcaReport>,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelemetryResponse {
    samples: Vec<TelemetrySample>,
}

#[derive(Debug, Deserialize)]
struct TelemetrySample {
    ts: chrono::DateTime<chrono::Utc>,
    cpu: f64,
    ram: f64,
}

fn print_incident(incident: &SpikeIncident) {
    println!(
        "{} #{}  {}  cpu={:.1}%  ram={:.1}%",
        "spike".bold(),
        incident.id,
        incident.detected_at.to_rfc3339(),
        incident.cpu_at_confirm,
        incident.ram_at_confirm,
    );
    for suspect in incident.ranked_suspects.iter().take(5) {
        println!("  {:>6.2}  pid={:<8} {}", suspect.score, suspect.pid, suspect.name);
    }
    match &incident.rca {
        Some(rca) if rca.confidence > 0.0 => {
            println!("  {} ({:.0}% confidence)", rca.cause_summary.green(), rca.confidence * 100.0);
        }
        Some(rca) => println!("  {}", rca.cause_summary.yellow()),
        None => println!("  {}", "rca pending".dimmed()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    match args.command {
        Command::Spikes { limit } => {
            let url = format!("{}/api/spikes?limit={limit}", args.server);
            let body: SpikesResponse = client.get(url).send().await?.json().await?;
            if body.spikes.is_empty() {
                println!("{}", "no spikes recorded".dimmed());
            }
            for incident in &body.spikes {
                print_incident(incident);
            }
        }
        Command::Spike { id } => {
            let url = format!("{}/api/spikes/{id}", args.server);
            let response = client.get(url).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                eprintln!("{}", format!("no spike with id {id}").red());
                std::process::exit(1);
            }
            let incident: SpikeIncident = response.json().await?;
            print_incident(&incident);
        }
        Command::LatestRca => {
            let url = format!("{}/api/latest-rca", args.server);
            let body: LatestRcaResponse = client.get(url).send().await?.json().await?;
            match body.latest_rca {
                Some(rca) => println!("{} ({:.0}%)", rca.cause_summary, rca.confidence * 100.0),
                None => println!("{}", "no rca available yet".dimmed()),
            }
        }
        Command::Events { limit } => {
            let url = format!("{}/api/events?limit={limit}", args.server);
            let body: EventsResponse = client.get(url).send().await?.json().await?;
            for event in &body.events {
                println!("{event}");
            }
        }
        Command::Telemetry { seconds } => {
            let url = format!("{}/api/telemetry/window?seconds={seconds}", args.server);
            let body: TelemetryResponse = client.get(url).send().await?.json().await?;
            for sample in &body.samples {
                println!(
                    "{}  cpu={:>5.1}%  ram={:>5.1}%",
                    sample.ts.to_rfc3339(),
                    sample.cpu,
                    sample.ram
                );
            }
        }
    }

    Ok(())
}
