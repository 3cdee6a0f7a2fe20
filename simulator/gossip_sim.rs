// Gossip Simulator - run replication scenarios from YAML files
//
// Usage:
//   cargo run --bin gossip_sim simulator/scenarios/line.yaml
//   cargo run --bin gossip_sim simulator/scenarios/  (runs all .yaml files in directory)
//   cargo run --bin gossip_sim simulator/scenarios/line.yaml --seed 0x1234...

use std::env;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chainweave::cw_commit::{Change, EntryValue, PendingCommit};
use chainweave::cw_database::Database;
use chainweave::cw_interface::{Key, Muid};
use chainweave::cw_transport::MemoryLink;
use chainweave::{ChainSequencer, CwError};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use simple_logger::SimpleLogger;

#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    meta: ScenarioMeta,

    config: ScenarioConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
enum Topology {
    Line,
    Ring,
    Full,
}

#[derive(Debug, serde::Deserialize)]
struct ScenarioConfig {
    peers: usize,

    topology: Topology,

    rounds: usize,

    /// Chance that a replica writes a commit in a given round
    #[serde(default = "default_commit_probability")]
    commit_probability: f64,

    #[serde(default = "default_entries_per_commit")]
    entries_per_commit: usize,

    /// Links are created after this round (0 = before the first round)
    #[serde(default)]
    connect_after_round: usize,
}

fn default_commit_probability() -> f64 {
    0.3
}

fn default_entries_per_commit() -> usize {
    1
}

struct Replica {
    db: Database,
    chain: ChainSequencer,
    /// Commits heard through the listener, local ones included
    heard: Arc<AtomicUsize>,
    written: usize,
}

impl Replica {
    fn new() -> Result<Self, CwError> {
        let db = Database::in_memory();
        let heard = Arc::new(AtomicUsize::new(0));
        let counter = heard.clone();
        db.add_listener(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let chain = db.acquire_chain()?;
        Ok(Self {
            db,
            chain,
            heard,
            written: 0,
        })
    }

    fn write(&mut self, index: usize, entries: usize, rng: &mut StdRng) -> Result<(), CwError> {
        let pending = PendingCommit::with_comment(format!("peer {} commit {}", index, self.written));
        for n in 0..entries {
            let value: u64 = rng.gen();
            pending.add_change(Change::entry(
                Muid::ROOT,
                Some(Key::from(format!("peer-{}/{}", index, n))),
                EntryValue::Scalar(value.to_be_bytes().to_vec()),
            ))?;
        }
        self.chain.add_commit(&pending, None).wait()?;
        self.written += 1;
        Ok(())
    }
}

struct SimResult {
    seed_used: [u8; 32],
    commits_written: usize,
    messages_delivered: usize,
    commits_per_replica: Vec<usize>,
    heard_per_replica: Vec<usize>,
    converged: bool,
}

impl SimResult {
    fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        Gossip Simulation Results                       ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("  Seed: {}", hex(&self.seed_used));
        println!("  Commits written: {}", self.commits_written);
        println!("  Messages delivered: {}", self.messages_delivered);
        println!("  Commits stored per replica: {:?}", self.commits_per_replica);
        println!("  Commits heard per replica: {:?}", self.heard_per_replica);
        println!(
            "  Converged: {}",
            if self.converged { "yes" } else { "NO" }
        );
    }
}

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED_HEX]", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);
    let seed: Option<[u8; 32]> = if args.len() >= 4 && args[2] == "--seed" {
        Some(parse_seed_hex(&args[3]))
    } else {
        None
    };

    let mut scenarios = Vec::new();
    if path.is_file() {
        scenarios.push(path.to_path_buf());
    } else if path.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                let file = entry.path();
                if matches!(file.extension().and_then(|s| s.to_str()), Some("yaml" | "yml")) {
                    scenarios.push(file);
                }
            }
        }
        scenarios.sort();
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    }

    for scenario in &scenarios {
        if let Err(err) = run_scenario_file(scenario, seed) {
            eprintln!("Scenario {} failed: {}", scenario.display(), err);
            std::process::exit(1);
        }
    }
}

fn run_scenario_file(path: &Path, seed: Option<[u8; 32]>) -> Result<(), CwError> {
    info!("Loading scenario from: {}", path.display());
    let yaml_content = fs::read_to_string(path)?;
    let scenario: ScenarioFile = serde_yaml::from_str(&yaml_content)?;

    println!("\n╔════════════════════════════════════════════════════════╗");
    match scenario.meta.name {
        Some(ref name) => println!("║  {}", name),
        None => println!("║  Scenario: {}", path.display()),
    }
    println!("╚════════════════════════════════════════════════════════╝\n");
    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }
    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:\n  {}\n", hypothesis);
    }

    let result = run(&scenario.config, seed)?;
    result.print_summary();
    if !result.converged {
        warn!("replicas did not converge");
    }
    Ok(())
}

fn run(config: &ScenarioConfig, seed: Option<[u8; 32]>) -> Result<SimResult, CwError> {
    let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
    let mut rng = StdRng::from_seed(seed);

    let mut replicas = (0..config.peers)
        .map(|_| Replica::new())
        .collect::<Result<Vec<_>, _>>()?;

    let mut links: Vec<MemoryLink> = Vec::new();
    let mut messages_delivered = 0;

    for round in 0..config.rounds {
        if round == config.connect_after_round {
            links = connect(&replicas, config.topology)?;
            info!("round {}: connected {} links", round, links.len());
        }

        for (index, replica) in replicas.iter_mut().enumerate() {
            if rng.gen_bool(config.commit_probability.clamp(0.0, 1.0)) {
                replica.write(index, config.entries_per_commit, &mut rng)?;
            }
        }

        // one delivery pass per round, links in random order
        let mut order: Vec<usize> = (0..links.len()).collect();
        order.shuffle(&mut rng);
        for i in order {
            messages_delivered += links[i].pump()?;
        }
    }

    if links.is_empty() {
        links = connect(&replicas, config.topology)?;
    }
    loop {
        let mut delivered = 0;
        for link in &links {
            delivered += link.pump()?;
        }
        messages_delivered += delivered;
        if delivered == 0 {
            break;
        }
    }

    let mut commit_sets = Vec::new();
    for (index, replica) in replicas.iter().enumerate() {
        let chains = replica.db.store().get_chain_tracker()?.len();
        info!("replica {} knows {} chains", index, chains);
        commit_sets.push(replica.db.store().get_commit_infos()?);
    }
    let converged = commit_sets.windows(2).all(|pair| pair[0] == pair[1]);

    let result = SimResult {
        seed_used: seed,
        commits_written: replicas.iter().map(|r| r.written).sum(),
        messages_delivered,
        commits_per_replica: commit_sets.iter().map(Vec::len).collect(),
        heard_per_replica: replicas
            .iter()
            .map(|r| r.heard.load(Ordering::Relaxed))
            .collect(),
        converged,
    };

    for replica in replicas {
        replica.chain.close()?;
        replica.db.close()?;
    }
    Ok(result)
}

fn connect(replicas: &[Replica], topology: Topology) -> Result<Vec<MemoryLink>, CwError> {
    let n = replicas.len();
    let mut pairs = Vec::new();
    match topology {
        Topology::Line => pairs.extend((1..n).map(|i| (i - 1, i))),
        Topology::Ring => {
            pairs.extend((1..n).map(|i| (i - 1, i)));
            if n > 2 {
                pairs.push((n - 1, 0));
            }
        }
        Topology::Full => {
            for i in 0..n {
                for j in i + 1..n {
                    pairs.push((i, j));
                }
            }
        }
    }
    pairs
        .into_iter()
        .map(|(a, b)| MemoryLink::connect(replicas[a].db.sync().clone(), replicas[b].db.sync().clone()))
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_seed_hex(hex: &str) -> [u8; 32] {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i >= 32 {
            break;
        }
        let parsed = std::str::from_utf8(chunk)
            .ok()
            .and_then(|byte_str| u8::from_str_radix(byte_str, 16).ok());
        match parsed {
            Some(byte) => seed[i] = byte,
            None => {
                eprintln!("Invalid hex seed: {}", hex);
                std::process::exit(1);
            }
        }
    }

    seed
}
