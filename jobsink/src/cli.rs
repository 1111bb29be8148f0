use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use common::{JobInfo, JobKey, PhaseKind, Step, UnixTool};
use jobsink::{
    HttpJobService, HttpServiceConfig, JobService, JobSink, KeyFailurePolicy, ObjectFinder,
    PackageSpec, PackageStep, RemoteError, SinkConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "jobsink")]
#[command(about = "Arma un pipeline de comandos, le escribe claves y espera el resultado")]
struct Cli {
    /// URL del master (pisa MASTER_URL)
    #[arg(long, global = true)]
    master: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crea un job, le escribe claves y espera a que termine
    Run(RunArgs),
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los objetos bajo un prefijo
    Find {
        #[arg(value_name = "PREFIJO")]
        prefix: String,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "job")]
    name: String,

    /// Fase en orden de declaración: map=CMD o reduce=CMD ("grep x | wc -l")
    #[arg(long = "phase", value_name = "TIPO=CMD", required = true)]
    phases: Vec<PhaseArg>,

    /// Destino final en el object store (fase reduce extra)
    #[arg(long = "dest", value_name = "RUTA")]
    dests: Vec<String>,

    /// Paquete local a subir antes de crear el job
    #[arg(long = "package", value_name = "NOMBRE:VERSION:RUTA")]
    packages: Vec<PackageArg>,

    /// Usa como claves los objetos bajo este prefijo (si no, lee stdin)
    #[arg(long, value_name = "PREFIJO")]
    find: Option<String>,

    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Intervalo de consulta de estado, en milisegundos (mínimo 1)
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    poll_ms: u64,

    #[arg(long)]
    abort_on_key_failure: bool,

    #[arg(long, default_value = common::DEFAULT_IMAGE)]
    image: String,
}

#[derive(Debug, Clone, PartialEq)]
struct PhaseArg {
    kind: PhaseKind,
    command: String,
}

impl FromStr for PhaseArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, command) = s
            .split_once('=')
            .ok_or_else(|| format!("fase inválida '{s}', se esperaba TIPO=CMD"))?;
        let command = command.trim();
        if command.is_empty() {
            return Err(format!("fase '{kind}' sin comando"));
        }
        Ok(Self {
            kind: kind.trim().parse()?,
            command: command.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PackageArg(PackageSpec);

impl FromStr for PackageArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(version), Some(path))
                if !name.is_empty() && !version.is_empty() && !path.is_empty() =>
            {
                Ok(Self(PackageSpec {
                    name: name.to_string(),
                    version: version.to_string(),
                    path: PathBuf::from(path),
                }))
            }
            _ => Err(format!("paquete inválido '{s}', se esperaba NOMBRE:VERSION:RUTA")),
        }
    }
}

/// Parte `cmd` en `|` y enlaza un paso por segmento. Si la primera palabra
/// es un paquete pedido, el paso lleva su asset e init.
fn build_chain(command: &str, tools: &HashMap<String, PackageStep>) -> Result<Step> {
    let mut steps = Vec::new();
    for segment in command.split('|') {
        let mut words = segment.split_whitespace();
        let Some(exe) = words.next() else {
            bail!("segmento vacío en '{command}'");
        };
        let step = match tools.get(exe) {
            Some(tool) => tool.step(words),
            None => UnixTool::new(exe).step(words),
        };
        steps.push(step);
    }

    Step::chain(steps)?.ok_or_else(|| anyhow!("comando vacío"))
}

async fn read_stdin_keys(tx: mpsc::Sender<JobKey>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.send(JobKey::new(line)).await.is_err() {
            break;
        }
    }
    Ok(())
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.state);
    println!("  claves: {}", job.keys);
    println!("  entrada cerrada: {}", job.input_done);
    println!("  fases:");
    for (i, phase) in job.phases.iter().enumerate() {
        println!("    {}. {}: {}", i + 1, phase.kind, phase.exec);
        for asset in &phase.assets {
            println!("       asset: {}", asset);
        }
    }
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
}

async fn run_job(service: Arc<HttpJobService>, args: RunArgs) -> Result<()> {
    let config = SinkConfig {
        name: args.name,
        image: args.image,
        poll_interval: Duration::from_millis(args.poll_ms),
        key_failure_policy: if args.abort_on_key_failure {
            KeyFailurePolicy::Abort
        } else {
            KeyFailurePolicy::Continue
        },
        ..SinkConfig::default()
    };

    // se listan antes de crear nada: si falla no queda un job vacío
    let found = match &args.find {
        Some(prefix) => Some(ObjectFinder::new(service.clone()).find(prefix).await?),
        None => None,
    };

    let sink = JobSink::new(config, service);

    let mut tools = HashMap::new();
    for PackageArg(package) in args.packages {
        let name = package.name.clone();
        let step = sink.request_package(package).await?;
        tools.insert(name, step);
    }

    for phase in &args.phases {
        let step = build_chain(&phase.command, &tools)?;
        match phase.kind {
            PhaseKind::Map => sink.declare_map_phase(step).await?,
            PhaseKind::Reduce => sink.declare_reduce_phase(step).await?,
        }
    }
    for dest in args.dests {
        sink.add_terminal_destination(dest).await?;
    }

    let (tx, rx) = mpsc::channel(args.concurrency.max(1) * 4);
    let producer = match found {
        Some(keys) => {
            info!("{} claves encontradas", keys.len());
            tokio::spawn(async move {
                for key in keys {
                    if tx.send(key).await.is_err() {
                        break;
                    }
                }
                Ok::<(), anyhow::Error>(())
            })
        }
        None => tokio::spawn(read_stdin_keys(tx)),
    };

    let summary = sink.feed(rx, args.concurrency).await?;
    producer.await??;
    if summary.failed > 0 {
        warn!("{} claves no se pudieron agregar", summary.failed);
    }

    let job = sink.wait().await?;
    println!(
        "Claves: escritas={}, fallidas={}",
        summary.written, summary.failed
    );
    print_job(&job);
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let base_url = cli.master.unwrap_or_else(master_base_url);
    let service = Arc::new(HttpJobService::new(HttpServiceConfig {
        base_url,
        ..HttpServiceConfig::default()
    })?);

    match cli.command {
        Commands::Run(args) => run_job(service, args).await?,

        Commands::Status { id } => match service.get_job_status(&id).await {
            Ok(job) => print_job(&job),
            Err(RemoteError::Status { status: 404, .. }) => {
                println!("Error: job no encontrado ({id})");
            }
            Err(e) => return Err(e.into()),
        },

        Commands::Find { prefix } => {
            let keys = ObjectFinder::new(service).find(&prefix).await?;
            if keys.is_empty() {
                println!("(sin objetos bajo {prefix})");
            }
            for key in keys {
                println!("{key}");
            }
        }
    }

    Ok(())
}
