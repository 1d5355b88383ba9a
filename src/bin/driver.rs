//! CLI driver (§6): reads `n t` and `n-t` input bits from stdin, runs that many nodes in-process,
//! and prints the decided bits once every node has terminated.

use std::io::{self, Read};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rand::SeedableRng;
use tracing::error;
use tracing_subscriber::EnvFilter;

use aba_core::certification::CertificationRegistry;
use aba_core::instance_id::SystemInstanceIdSource;
use aba_core::network_info::{NetworkInfoBuilder, NodeId};
use aba_core::node::NodeService;
use aba_core::transport::PeerRegistry;

/// Runs an in-process Asynchronous Byzantine Agreement simulation.
#[derive(Parser)]
#[command(name = "aba-driver")]
struct Cli {
    /// Suppress tracing logs; only the RESULTS line is printed.
    #[arg(long)]
    silent: bool,
}

struct Input {
    n: usize,
    t: usize,
    bits: Vec<bool>,
}

fn parse_input() -> io::Result<Input> {
    let mut raw = String::new();
    io::stdin().read_to_string(&mut raw)?;
    let mut tokens = raw.split_whitespace();

    let n = next_usize(&mut tokens, "n")?;
    let t = next_usize(&mut tokens, "t")?;
    let honest = n.saturating_sub(t);
    let mut bits = Vec::with_capacity(honest);
    for i in 0..honest {
        let bit = next_usize(&mut tokens, "input bit")?;
        if bit > 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("input bit {i} must be 0 or 1")));
        }
        bits.push(bit == 1);
    }
    if bits.len() != honest {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {honest} input bits, got {}", bits.len()),
        ));
    }
    Ok(Input { n, t, bits })
}

fn next_usize(tokens: &mut std::str::SplitWhitespace<'_>, what: &str) -> io::Result<usize> {
    tokens
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, format!("missing {what}")))?
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("invalid {what}")))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if !cli.silent {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }

    let input = match parse_input() {
        Ok(input) => input,
        Err(e) => {
            eprintln!("aba-driver: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(input).await {
        Ok(results) => {
            let rendered: Vec<&str> = results.iter().map(|&b| if b { "1" } else { "0" }).collect();
            println!("RESULTS: {}", rendered.join(" "));
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("aba-driver failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(input: Input) -> aba_core::Result<Vec<bool>> {
    let honest = input.bits.len();
    let ids: Vec<NodeId> = (1..=honest as u64).map(NodeId).collect();
    let (transport, mut inboxes) = PeerRegistry::build(ids.iter().copied());

    let mut handles = Vec::with_capacity(honest);
    for (idx, &id) in ids.iter().enumerate() {
        let net = NetworkInfoBuilder::new(id, input.n, input.t).build();
        let registry = Arc::new(CertificationRegistry::new());
        let source = Arc::new(SystemInstanceIdSource) as Arc<dyn aba_core::instance_id::InstanceIdSource>;
        let rng = rand::rngs::StdRng::from_entropy();
        let inbox = inboxes.remove(&id).expect("every id has an inbox");
        let node = NodeService::new(net, registry, source, transport.clone(), rng, input.bits[idx]);
        handles.push(tokio::spawn(node.run(inbox)));
    }

    let mut results = Vec::with_capacity(honest);
    for handle in handles {
        let decision = handle.await.expect("node task panicked")?;
        results.push(decision);
    }
    Ok(results)
}
