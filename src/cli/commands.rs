//! CLI commands for the coin node
//!
//! Implements the command handlers for the CLI interface.

use crate::config::NodeConfig;
use crate::core::{Ledger, Transaction};
use crate::crypto::Signer;
use crate::mining::Miner;
use crate::network::{MemoryNetwork, Node, NodeStatus};
use std::path::Path;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// One payment requested on the command line as `from:to:value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub from: String,
    pub to: String,
    pub value: u64,
}

/// Parse `from:to:value`
pub fn parse_transfer(s: &str) -> Result<TransferSpec, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [from, to, value] = parts.as_slice() else {
        return Err(format!("expected from:to:value, got '{}'", s));
    };
    let value = value
        .parse::<u64>()
        .map_err(|e| format!("bad value in '{}': {}", s, e))?;
    if from.is_empty() || to.is_empty() {
        return Err(format!("empty node name in '{}'", s));
    }
    Ok(TransferSpec {
        from: from.to_string(),
        to: to.to_string(),
        value,
    })
}

/// Node names used by `simulate`: n1, n2, ...
pub fn node_names(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("n{}", i)).collect()
}

/// Options for `simulate`
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Settings shared by every node; names are assigned per node
    pub template: NodeConfig,
    pub nodes: usize,
    pub transfers: Vec<TransferSpec>,
    /// How long to wait for each confirmation
    pub timeout: Duration,
    pub json: bool,
}

/// Run a cluster of nodes over the in-memory network and carry out the
/// requested transfers one after another.
pub async fn cmd_simulate(options: SimulateOptions) -> CliResult<Vec<NodeStatus>> {
    if options.nodes < 3 {
        return Err("at least three nodes are needed: confirmations are mined by a third party".into());
    }

    let network = MemoryNetwork::new();
    let mut nodes = Vec::new();
    for name in node_names(options.nodes) {
        let config = NodeConfig {
            name,
            ..options.template.clone()
        };
        let transports = network.join("127.0.0.1")?;
        nodes.push(Node::start(config, transports).await?);
    }

    println!(
        "🌐 Started {} nodes ({} zero bits, {} coins to {})",
        nodes.len(),
        options.template.required_zero_bits,
        options.template.genesis.stake,
        options.template.genesis.beneficiary
    );

    for transfer in &options.transfers {
        let Some(sender) = nodes.iter().find(|node| node.name() == transfer.from) else {
            println!("⚠️  Unknown node {}, skipping", transfer.from);
            continue;
        };

        // Nodes may disagree on height after an earlier timeout.
        let targets = next_heights(&nodes).await;
        match sender.send_coin(&transfer.to, transfer.value).await {
            Ok(id) => println!(
                "💸 {} -> {}: {} coins ({})",
                transfer.from, transfer.to, transfer.value, id
            ),
            Err(e) => {
                println!("❌ {} -> {} declined: {}", transfer.from, transfer.to, e);
                continue;
            }
        }

        if wait_for_heights(&nodes, &targets, options.timeout).await {
            let height = targets.iter().copied().max().unwrap_or_default();
            println!("   ✅ Confirmed at height {}", height);
        } else {
            println!("   ⏳ Not confirmed everywhere within {:?}", options.timeout);
        }
    }

    let mut statuses = Vec::new();
    for node in &nodes {
        statuses.push(node.status().await);
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        println!("\n📊 Final state:");
        for status in &statuses {
            println!(
                "   {} @ {}: height {}, balance {}, head {}",
                status.name,
                status.address,
                status.height,
                status.balance,
                &status.latest_hash[..16]
            );
        }
    }

    for node in nodes {
        node.shutdown().await;
    }
    Ok(statuses)
}

/// The height each node reaches once one more block is admitted
async fn next_heights(nodes: &[Node]) -> Vec<usize> {
    let mut heights = Vec::with_capacity(nodes.len());
    for node in nodes {
        heights.push(node.height().await + 1);
    }
    heights
}

/// Wait for every node to reach its own target height
async fn wait_for_heights(nodes: &[Node], targets: &[usize], limit: Duration) -> bool {
    let mut reached = true;
    for (node, target) in nodes.iter().zip(targets) {
        reached &= node.wait_for_height(*target, limit).await;
    }
    reached
}

/// Mine a throwaway block at `bits` zero bits and report the cost
pub fn cmd_mine(bits: u32, workers: usize) -> CliResult<()> {
    let template = NodeConfig::default();
    let ledger = Ledger::new(&template.genesis, bits)?;
    let signer = Signer::generate();
    let transaction = Transaction::leaf(&template.genesis.beneficiary, "bench", 1, "bench")
        .signed(&signer)?;
    let block = ledger.next_block(&template.genesis.beneficiary, transaction);

    println!("⛏️  Mining with {} zero bits on {} worker(s)", bits, workers);

    let Some((block, stats)) = Miner::new(workers).mine(block) else {
        return Err(format!("no nonce satisfies {} zero bits", bits).into());
    };

    println!("\n   Block {} confirmed!", block.short_hash());
    println!("   ├─ Nonce: {}", block.nonce);
    println!("   ├─ Time: {}ms", stats.time_ms);
    println!("   ├─ Attempts: {}", stats.hash_attempts);
    println!("   └─ Hash rate: {:.2} H/s", stats.hash_rate);

    Ok(())
}

/// Write a node configuration with defaults filled in
pub fn cmd_config(path: &Path, name: &str) -> CliResult<()> {
    let config = NodeConfig::named(name);
    config.validate()?;
    config.save(path)?;

    println!("✅ Configuration written to {:?}", path);
    println!("   📛 Name: {}", config.name);
    println!("   🔧 Zero bits: {}", config.required_zero_bits);
    println!(
        "   🧱 Genesis: {} coins to {}",
        config.genesis.stake, config.genesis.beneficiary
    );

    Ok(())
}
